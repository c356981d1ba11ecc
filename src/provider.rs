//! Provider traits and implementations for machine provisioning.
//!
//! A [`Provider`] allocates, reuses and accounts for the remote machines
//! of one backend. The set of provider kinds is closed and chosen at
//! construction from `backend.type`; [`providers_for`] builds the dispatch
//! table the runner consults.

pub mod linode;
pub mod lxd;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::{Backend, Project};

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProvisionError>;

/// Errors raised while allocating, reusing, or discarding machines.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Unrecoverable: retrying cannot help (bad credentials, unknown
    /// system). Aborts the worker instead of entering the retry loop.
    #[error("{0}")]
    Fatal(String),

    #[error("cannot allocate: {0}")]
    Allocate(String),

    #[error("cannot discard: {0}")]
    Discard(String),

    #[error("invalid reuse data: {0}")]
    ReuseData(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProvisionError::Fatal(_))
    }
}

/// Identity blob persisted on the remote so a later run can reclaim the
/// machine from nothing but its address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReuseData {
    pub backend: String,
    pub system: String,
    /// Provider-specific machine identity (container name, instance id).
    pub instance: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

impl ReuseData {
    pub fn to_yaml(&self) -> Vec<u8> {
        // Infallible for this plain struct.
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .unwrap_or_default()
    }

    pub fn from_yaml(data: &[u8]) -> ProviderResult<ReuseData> {
        serde_yaml::from_slice(data).map_err(|e| ProvisionError::ReuseData(e.to_string()))
    }
}

/// A provisioned remote machine.
///
/// `discard` must be idempotent: releasing an already-released machine is
/// not an error.
#[async_trait]
pub trait Server: Send + Sync {
    /// Address the machine is dialed at (`host` or `host:port`).
    fn address(&self) -> &str;

    /// Name of the backend this machine belongs to.
    fn backend_name(&self) -> &str;

    /// Human-readable identity for log lines.
    fn label(&self) -> String;

    /// Identity blob written to the remote for later reuse.
    fn reuse_data(&self) -> Vec<u8>;

    /// Releases the machine. Idempotent.
    async fn discard(&self) -> ProviderResult<()>;
}

/// A reused address whose provider-specific identity has not yet been
/// recovered from the blob stored on the machine itself.
pub struct UnknownServer {
    backend: String,
    address: String,
}

impl UnknownServer {
    pub fn new(backend: String, address: String) -> Self {
        UnknownServer { backend, address }
    }
}

#[async_trait]
impl Server for UnknownServer {
    fn address(&self) -> &str {
        &self.address
    }

    fn backend_name(&self) -> &str {
        &self.backend
    }

    fn label(&self) -> String {
        format!("{} ({})", self.backend, self.address)
    }

    fn reuse_data(&self) -> Vec<u8> {
        Vec::new()
    }

    async fn discard(&self) -> ProviderResult<()> {
        // Nothing to release: the identity was never recovered.
        Ok(())
    }
}

/// Allocator/reuser of machines for one backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn backend(&self) -> &Arc<Backend>;

    /// Provisions a fresh machine running `system`, with root access under
    /// `password`.
    async fn allocate(&self, system: &str, password: &str) -> ProviderResult<Arc<dyn Server>>;

    /// Recovers a typed server from the identity blob a previous run left
    /// on the machine.
    async fn reuse(&self, data: &[u8], password: &str) -> ProviderResult<Arc<dyn Server>>;
}

/// Builds the provider table for every backend of the project.
///
/// # Errors
///
/// Fails when a backend declares a type outside the supported set.
pub fn providers_for(project: &Project) -> anyhow::Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    for (name, backend) in &project.backends {
        let provider: Arc<dyn Provider> = match backend.kind.as_str() {
            "linode" => Arc::new(linode::LinodeProvider::new(backend.clone())),
            "lxd" => Arc::new(lxd::LxdProvider::new(backend.clone())),
            other => anyhow::bail!("backend {name} has unsupported type {other:?}"),
        };
        providers.insert(name.clone(), provider);
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    #[test]
    fn test_reuse_data_round_trip() {
        let data = ReuseData {
            backend: "garden".to_string(),
            system: "noble".to_string(),
            instance: "stampede-1a2b3c4d".to_string(),
            address: "10.0.3.17".to_string(),
            created_at: Utc::now(),
        };
        let parsed = ReuseData::from_yaml(&data.to_yaml()).unwrap();
        assert_eq!(parsed.backend, "garden");
        assert_eq!(parsed.instance, "stampede-1a2b3c4d");
        assert_eq!(parsed.address, "10.0.3.17");
    }

    #[test]
    fn test_reuse_data_rejects_garbage() {
        let err = ReuseData::from_yaml(b"{{nope").unwrap_err();
        assert!(matches!(err, ProvisionError::ReuseData(_)));
    }

    #[test]
    fn test_providers_for_rejects_unknown_type() {
        let project = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.mystery]
            type = "teleport"
            systems = ["sys"]

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap();
        let err = providers_for(&project).err().unwrap();
        assert!(err.to_string().contains("unsupported type"));
    }

    #[test]
    fn test_providers_for_builds_known_types() {
        let project = load_config_str(
            r#"
            [project]
            remote-path = "/root/p"

            [backends.garden]
            type = "lxd"
            systems = ["noble"]

            [backends.cloud]
            type = "linode"
            systems = ["debian-12"]

            [suites.s]
            [suites.s.tasks.t]
            execute = "true"
        "#,
        )
        .unwrap();
        let providers = providers_for(&project).unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers["garden"].backend().name, "garden");
        assert_eq!(providers["cloud"].backend().name, "cloud");
    }
}
