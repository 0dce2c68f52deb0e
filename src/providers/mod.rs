//! Provider backends (C6, spec §4.5): `local`, `docker`, `ssh`,
//! `cloud-sandbox`, behind one trait and a process-global registry.
//!
//! The registry shape is grounded directly on
//! `original_source/libs/mngr/imbue/mngr/providers/registry.py`'s
//! `_backend_registry` / `reset_backend_registry`: a module-global map from
//! backend name to constructor, with an explicit reset hook for test
//! isolation (tests that touch it use `serial_test`, as
//! `alfredjeanlab-oddjobs` does for its own global state).

pub mod cloud_sandbox;
pub mod docker;
pub mod local;
pub mod ssh;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;

use crate::concurrency::ConcurrencyGroup;
use crate::error::MngrResult;
use crate::host::HostInterface;
use crate::models::HostRecord;
use crate::primitives::{HostId, HostName, ProviderBackendName};

#[derive(Debug, Clone, Default)]
pub struct HostCreateOptions {
    pub image: Option<String>,
    pub tags: Vec<String>,
    pub build_args: HashMap<String, String>,
    pub start_args: HashMap<String, String>,
    pub known_hosts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct HostResources {
    pub cpu_count: Option<u32>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

/// One provider instance's view onto the hosts it owns. Implemented once per
/// backend (`local`, `docker`, `ssh`, `cloud-sandbox`).
#[async_trait]
pub trait ProviderBackendInterface: Send + Sync {
    fn backend_name(&self) -> ProviderBackendName;

    async fn list_hosts(
        &self,
        cg: &ConcurrencyGroup,
        include_destroyed: bool,
    ) -> MngrResult<Vec<HostRecord>>;

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord>;

    async fn create_host(
        &self,
        name: &HostName,
        options: HostCreateOptions,
    ) -> MngrResult<HostRecord>;

    async fn stop_host(&self, id: &HostId) -> MngrResult<()>;
    async fn start_host(&self, id: &HostId) -> MngrResult<()>;
    async fn destroy_host(&self, id: &HostId) -> MngrResult<()>;
    async fn rename_host(&self, id: &HostId, new_name: &HostName) -> MngrResult<()>;

    async fn get_host_resources(&self, id: &HostId) -> MngrResult<HostResources>;
    async fn get_host_tags(&self, id: &HostId) -> MngrResult<Vec<String>>;
    async fn add_tags_to_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()>;
    async fn remove_tags_from_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()>;
    async fn set_host_tags(&self, id: &HostId, tags: &[String]) -> MngrResult<()>;

    /// Called by the engine when a connection attempt to a host fails, so
    /// the backend can mark it degraded without the caller guessing why.
    async fn on_connection_error(&self, id: &HostId);

    /// Build (or look up a cached) [`HostInterface`] for talking to `id`.
    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>>;

    fn supports_snapshots(&self) -> bool {
        false
    }
    fn supports_shutdown_hosts(&self) -> bool {
        true
    }
    fn supports_volumes(&self) -> bool {
        false
    }
    fn supports_mutable_tags(&self) -> bool {
        true
    }

    async fn create_snapshot(&self, _id: &HostId, _label: &str) -> MngrResult<String> {
        Err(crate::error::MngrError::UserInput(
            "this backend does not support snapshots".to_string(),
        ))
    }
    async fn list_snapshots(&self, _id: &HostId) -> MngrResult<Vec<String>> {
        Ok(Vec::new())
    }
    async fn delete_snapshot(&self, _id: &HostId, _snapshot_id: &str) -> MngrResult<()> {
        Err(crate::error::MngrError::UserInput(
            "this backend does not support snapshots".to_string(),
        ))
    }
}

type BackendFactory = Arc<dyn Fn() -> Arc<dyn ProviderBackendInterface> + Send + Sync>;

fn registry() -> &'static RwLock<HashMap<ProviderBackendName, BackendFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<ProviderBackendName, BackendFactory>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register (or replace) the constructor for a backend name.
pub fn register_backend_factory(
    name: ProviderBackendName,
    factory: impl Fn() -> Arc<dyn ProviderBackendInterface> + Send + Sync + 'static,
) {
    registry()
        .write()
        .expect("provider registry lock poisoned")
        .insert(name, Arc::new(factory));
}

pub fn build_provider_instance(name: ProviderBackendName) -> Option<Arc<dyn ProviderBackendInterface>> {
    let guard = registry().read().expect("provider registry lock poisoned");
    guard.get(&name).map(|factory| factory())
}

pub fn list_registered_backends() -> Vec<ProviderBackendName> {
    registry()
        .read()
        .expect("provider registry lock poisoned")
        .keys()
        .copied()
        .collect()
}

/// Test-only reset hook, mirroring `reset_backend_registry`.
pub fn reset_backend_registry() {
    registry()
        .write()
        .expect("provider registry lock poisoned")
        .clear();
}

/// Register the backends this crate ships built-in. Called once at
/// start-up by the binaries; idempotent.
pub fn register_builtin_backends() {
    register_backend_factory(ProviderBackendName::Local, || {
        Arc::new(local::LocalBackend::new())
    });
    register_backend_factory(ProviderBackendName::Docker, || {
        Arc::new(docker::DockerBackend::new())
    });
    register_backend_factory(ProviderBackendName::Ssh, || Arc::new(ssh::SshBackend::new()));
    register_backend_factory(ProviderBackendName::CloudSandbox, || {
        Arc::new(cloud_sandbox::CloudSandboxBackend::new())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn register_and_build_round_trips() {
        reset_backend_registry();
        register_backend_factory(ProviderBackendName::Local, || {
            Arc::new(local::LocalBackend::new())
        });
        let backend = build_provider_instance(ProviderBackendName::Local);
        assert!(backend.is_some());
        assert_eq!(backend.unwrap().backend_name(), ProviderBackendName::Local);
        reset_backend_registry();
    }

    #[test]
    #[serial]
    fn unregistered_backend_returns_none() {
        reset_backend_registry();
        assert!(build_provider_instance(ProviderBackendName::Docker).is_none());
    }
}
