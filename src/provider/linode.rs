//! Linode provider: cloud instances driven through `linode-cli`.
//!
//! Allocation creates an instance with the backend's region and plan,
//! polls until it reports running, and returns its public address.
//! Authentication problems are reported as fatal so the acquirer aborts
//! instead of retrying a hopeless loop.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::{Provider, ProviderResult, ProvisionError, ReuseData, Server};
use crate::project::Backend;

/// How long to wait for a created instance to report running.
const BOOT_WAIT: Duration = Duration::from_secs(25);
const BOOT_POLL: Duration = Duration::from_secs(3);

pub struct LinodeProvider {
    backend: Arc<Backend>,
}

impl LinodeProvider {
    pub fn new(backend: Arc<Backend>) -> Self {
        LinodeProvider { backend }
    }

    async fn wait_for_running(&self, id: u64) -> ProviderResult<()> {
        let id = id.to_string();
        let deadline = tokio::time::Instant::now() + BOOT_WAIT;
        loop {
            let output = run_linode_cli(&["linodes", "view", &id, "--json"]).await?;
            let instances: Vec<InstanceView> = serde_json::from_str(&output)
                .map_err(|e| ProvisionError::Allocate(format!("cannot parse instance: {e}")))?;
            match instances.first() {
                Some(instance) if instance.status == "running" => return Ok(()),
                Some(_) => {}
                None => {
                    return Err(ProvisionError::Allocate(format!("instance {id} vanished")));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProvisionError::Allocate(format!(
                    "instance {id} did not reach running state"
                )));
            }
            tokio::time::sleep(BOOT_POLL).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstanceView {
    id: u64,
    status: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[async_trait]
impl Provider for LinodeProvider {
    fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    async fn allocate(&self, system: &str, password: &str) -> ProviderResult<Arc<dyn Server>> {
        let label = format!("stampede-{}", &Uuid::new_v4().simple().to_string()[..8]);
        debug!("Creating instance {} running {}", label, system);

        let output = run_linode_cli(&[
            "linodes",
            "create",
            "--label",
            &label,
            "--image",
            system,
            "--region",
            &self.backend.location,
            "--type",
            &self.backend.plan,
            "--root_pass",
            password,
            "--json",
        ])
        .await?;

        let instances: Vec<InstanceView> = serde_json::from_str(&output)
            .map_err(|e| ProvisionError::Allocate(format!("cannot parse create output: {e}")))?;
        let instance = instances
            .into_iter()
            .next()
            .ok_or_else(|| ProvisionError::Allocate("create returned no instance".to_string()))?;
        let address = instance
            .ipv4
            .first()
            .cloned()
            .ok_or_else(|| ProvisionError::Allocate("instance has no address".to_string()))?;

        let server = LinodeServer {
            backend: self.backend.clone(),
            system: system.to_string(),
            id: instance.id,
            address,
        };

        if let Err(e) = self.wait_for_running(instance.id).await {
            if let Err(e) = server.discard().await {
                debug!("Cannot discard instance {}: {}", instance.id, e);
            }
            return Err(e);
        }

        Ok(Arc::new(server))
    }

    async fn reuse(&self, data: &[u8], _password: &str) -> ProviderResult<Arc<dyn Server>> {
        let data = ReuseData::from_yaml(data)?;
        let id = data
            .instance
            .parse()
            .map_err(|_| ProvisionError::ReuseData(format!("bad instance id {:?}", data.instance)))?;
        Ok(Arc::new(LinodeServer {
            backend: self.backend.clone(),
            system: data.system,
            id,
            address: data.address,
        }))
    }
}

/// A provisioned Linode instance.
pub struct LinodeServer {
    backend: Arc<Backend>,
    system: String,
    id: u64,
    address: String,
}

#[async_trait]
impl Server for LinodeServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn backend_name(&self) -> &str {
        &self.backend.name
    }

    fn label(&self) -> String {
        format!("{}:{} (linode {})", self.backend.name, self.system, self.id)
    }

    fn reuse_data(&self) -> Vec<u8> {
        ReuseData {
            backend: self.backend.name.clone(),
            system: self.system.clone(),
            instance: self.id.to_string(),
            address: self.address.clone(),
            created_at: Utc::now(),
        }
        .to_yaml()
    }

    async fn discard(&self) -> ProviderResult<()> {
        let id = self.id.to_string();
        match run_linode_cli(&["linodes", "delete", &id]).await {
            Ok(_) => Ok(()),
            // Already gone counts as released.
            Err(ProvisionError::Allocate(msg)) if msg.contains("404") => Ok(()),
            Err(ProvisionError::Allocate(msg)) if msg.contains("Not found") => Ok(()),
            Err(ProvisionError::Allocate(msg)) => Err(ProvisionError::Discard(msg)),
            Err(e) => Err(e),
        }
    }
}

async fn run_linode_cli(args: &[&str]) -> ProviderResult<String> {
    let output: Output = tokio::process::Command::new("linode-cli")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("linode-cli {} failed: {}", args.join(" "), stderr.trim());
        if is_auth_failure(&stderr) {
            return Err(ProvisionError::Fatal(message));
        }
        return Err(ProvisionError::Allocate(message));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Credential problems cannot be retried away.
fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("unauthorized")
        || lower.contains("invalid token")
        || lower.contains("authentication")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_fatal() {
        assert!(is_auth_failure("Error: Invalid Token provided"));
        assert!(is_auth_failure("401 Unauthorized"));
        assert!(!is_auth_failure("429 Too Many Requests"));
        assert!(!is_auth_failure("region capacity exceeded"));
    }

    #[test]
    fn test_instance_view_parses_create_output() {
        let json = r#"[{
            "id": 44882261,
            "label": "stampede-9f2e11aa",
            "status": "provisioning",
            "ipv4": ["203.0.113.40"],
            "region": "us-east"
        }]"#;
        let instances: Vec<InstanceView> = serde_json::from_str(json).unwrap();
        assert_eq!(instances[0].id, 44882261);
        assert_eq!(instances[0].status, "provisioning");
        assert_eq!(instances[0].ipv4, vec!["203.0.113.40"]);
    }
}
