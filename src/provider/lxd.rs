//! LXD provider: containers driven through the `lxc` command line.
//!
//! Allocation launches a container from the image matching the requested
//! system, waits for it to come up with an address, and enables root SSH
//! access under the run password. Discard force-deletes the container.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{Provider, ProviderResult, ProvisionError, ReuseData, Server};
use crate::project::Backend;

/// How long to wait for a launched container to publish an address.
const ADDRESS_WAIT: Duration = Duration::from_secs(25);
const ADDRESS_POLL: Duration = Duration::from_secs(1);

pub struct LxdProvider {
    backend: Arc<Backend>,
}

impl LxdProvider {
    pub fn new(backend: Arc<Backend>) -> Self {
        LxdProvider { backend }
    }

    /// Polls `lxc list` until the container reports an IPv4 address.
    async fn wait_for_address(&self, name: &str) -> ProviderResult<String> {
        let deadline = tokio::time::Instant::now() + ADDRESS_WAIT;
        loop {
            let output = run_lxc(&["list", name, "--format", "json"]).await?;
            if let Some(address) = first_inet_address(&output) {
                return Ok(address);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionError::Allocate(format!(
                    "container {name} did not obtain an address"
                )));
            }
            tokio::time::sleep(ADDRESS_POLL).await;
        }
    }

    /// Sets the root password and allows password logins over SSH.
    async fn enable_root_ssh(&self, name: &str, password: &str) -> ProviderResult<()> {
        let setup = format!(
            "echo root:{password} | chpasswd && \
             sed -i -e 's/^#\\?PermitRootLogin.*/PermitRootLogin yes/' \
                    -e 's/^#\\?PasswordAuthentication.*/PasswordAuthentication yes/' \
                    /etc/ssh/sshd_config && \
             (systemctl reload ssh || systemctl reload sshd || true)"
        );
        run_lxc(&["exec", name, "--", "sh", "-c", &setup]).await?;
        Ok(())
    }
}

#[async_trait]
impl Provider for LxdProvider {
    fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    async fn allocate(&self, system: &str, password: &str) -> ProviderResult<Arc<dyn Server>> {
        let name = format!("stampede-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let image = image_for(system);
        debug!("Launching container {} from image {}", name, image);

        run_lxc(&["launch", &image, &name]).await?;

        let server = |address: String| LxdServer {
            backend: self.backend.clone(),
            system: system.to_string(),
            name: name.clone(),
            address,
        };

        let address = match self.wait_for_address(&name).await {
            Ok(address) => address,
            Err(e) => {
                // Half-launched container: take it down before reporting.
                if let Err(e) = server(String::new()).discard().await {
                    debug!("Cannot discard container {}: {}", name, e);
                }
                return Err(e);
            }
        };
        if let Err(e) = self.enable_root_ssh(&name, password).await {
            if let Err(e) = server(address).discard().await {
                debug!("Cannot discard container {}: {}", name, e);
            }
            return Err(e);
        }

        Ok(Arc::new(server(address)))
    }

    async fn reuse(&self, data: &[u8], _password: &str) -> ProviderResult<Arc<dyn Server>> {
        let data = ReuseData::from_yaml(data)?;
        Ok(Arc::new(LxdServer {
            backend: self.backend.clone(),
            system: data.system,
            name: data.instance,
            address: data.address,
        }))
    }
}

/// A running LXD container.
pub struct LxdServer {
    backend: Arc<Backend>,
    system: String,
    name: String,
    address: String,
}

#[async_trait]
impl Server for LxdServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn backend_name(&self) -> &str {
        &self.backend.name
    }

    fn label(&self) -> String {
        format!("{}:{} ({})", self.backend.name, self.system, self.name)
    }

    fn reuse_data(&self) -> Vec<u8> {
        ReuseData {
            backend: self.backend.name.clone(),
            system: self.system.clone(),
            instance: self.name.clone(),
            address: self.address.clone(),
            created_at: Utc::now(),
        }
        .to_yaml()
    }

    async fn discard(&self) -> ProviderResult<()> {
        match run_lxc(&["delete", "--force", &self.name]).await {
            Ok(_) => Ok(()),
            // Already gone counts as released.
            Err(ProvisionError::Allocate(msg)) if msg.contains("not found") => Ok(()),
            Err(ProvisionError::Allocate(msg)) => Err(ProvisionError::Discard(msg)),
            Err(e) => Err(e),
        }
    }
}

/// Maps a system name to an LXD image alias: `ubuntu-24.04` launches from
/// `ubuntu:24.04`; names carrying an explicit remote are used as-is.
fn image_for(system: &str) -> String {
    if system.contains(':') {
        system.to_string()
    } else {
        system.replacen('-', ":", 1)
    }
}

async fn run_lxc(args: &[&str]) -> ProviderResult<String> {
    let output: Output = tokio::process::Command::new("lxc")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        return Err(ProvisionError::Allocate(format!(
            "lxc {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extracts the first global IPv4 address from `lxc list --format json`.
fn first_inet_address(json: &str) -> Option<String> {
    let containers: serde_json::Value = serde_json::from_str(json).ok()?;
    let networks = containers.get(0)?.get("state")?.get("network")?;
    for (device, state) in networks.as_object()? {
        if device == "lo" {
            continue;
        }
        for address in state.get("addresses")?.as_array()? {
            if address.get("family")?.as_str()? == "inet"
                && address.get("scope").and_then(|s| s.as_str()) == Some("global")
            {
                return Some(address.get("address")?.as_str()?.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_for_maps_dashed_systems() {
        assert_eq!(image_for("ubuntu-24.04"), "ubuntu:24.04");
        assert_eq!(image_for("images:alpine/3.20"), "images:alpine/3.20");
        assert_eq!(image_for("noble"), "noble");
    }

    #[test]
    fn test_first_inet_address_parses_lxc_list() {
        let json = r#"[{
            "name": "stampede-1a2b3c4d",
            "state": {
                "network": {
                    "eth0": {
                        "addresses": [
                            {"family": "inet6", "address": "fd42::1", "scope": "global"},
                            {"family": "inet", "address": "10.0.3.17", "scope": "global"}
                        ]
                    },
                    "lo": {
                        "addresses": [
                            {"family": "inet", "address": "127.0.0.1", "scope": "local"}
                        ]
                    }
                }
            }
        }]"#;
        assert_eq!(first_inet_address(json), Some("10.0.3.17".to_string()));
    }

    #[test]
    fn test_first_inet_address_handles_pending_network() {
        let json = r#"[{"name": "x", "state": {"network": {}}}]"#;
        assert_eq!(first_inet_address(json), None);
        assert_eq!(first_inet_address("not json"), None);
    }
}
