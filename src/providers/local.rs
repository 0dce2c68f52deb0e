//! Local provider backend: treats the operator's own machine as a single
//! always-on host (spec §4.5). Grounded on
//! `original_source/libs/mng/imbue/mng/providers/local/backend_test.py`,
//! which exercises exactly one host, always reachable, no snapshot support.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::concurrency::ConcurrencyGroup;
use crate::error::{MngrError, MngrResult};
use crate::host::{HostInterface, LocalHost};
use crate::models::{HostRecord, HostState};
use crate::primitives::{HostId, HostName, ProviderBackendName, ProviderInstanceName};

use super::{HostCreateOptions, HostResources, ProviderBackendInterface};

/// There is exactly one local host per provider instance; it is created
/// lazily on first `create_host`/`list_hosts` call and always reachable.
pub struct LocalBackend {
    hosts: Mutex<HashMap<HostId, HostRecord>>,
    base_dir: PathBuf,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_base_dir(std::env::temp_dir().join("mngr-local-hosts"))
    }

    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            base_dir,
        }
    }

    fn host_dir(&self, id: &HostId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderBackendInterface for LocalBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::Local
    }

    async fn list_hosts(
        &self,
        _cg: &ConcurrencyGroup,
        include_destroyed: bool,
    ) -> MngrResult<Vec<HostRecord>> {
        let hosts = self.hosts.lock().expect("local backend lock poisoned");
        Ok(hosts
            .values()
            .filter(|h| include_destroyed || h.state != HostState::Destroyed)
            .cloned()
            .collect())
    }

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord> {
        let hosts = self.hosts.lock().expect("local backend lock poisoned");
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
        let record = HostRecord {
            id: HostId::new_random(),
            name: name.clone(),
            provider_name: ProviderInstanceName::new("local")?,
            state: HostState::Running,
            state_since: chrono::Utc::now(),
            snapshots: Vec::new(),
            tags: options.tags,
            plugin_data: HashMap::new(),
        };
        tokio::fs::create_dir_all(self.host_dir(&record.id)).await?;
        self.hosts
            .lock()
            .expect("local backend lock poisoned")
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn stop_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Stopped)
    }

    async fn start_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Running)
    }

    async fn destroy_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Destroyed)
    }

    async fn rename_host(&self, id: &HostId, new_name: &HostName) -> MngrResult<()> {
        let mut hosts = self.hosts.lock().expect("local backend lock poisoned");
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.name = new_name.clone();
        Ok(())
    }

    async fn get_host_resources(&self, _id: &HostId) -> MngrResult<HostResources> {
        Ok(HostResources {
            cpu_count: std::thread::available_parallelism().ok().map(|n| n.get() as u32),
            memory_bytes: None,
            disk_bytes: None,
        })
    }

    async fn get_host_tags(&self, id: &HostId) -> MngrResult<Vec<String>> {
        let hosts = self.hosts.lock().expect("local backend lock poisoned");
        Ok(hosts
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?
            .tags
            .clone())
    }

    async fn add_tags_to_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut hosts = self.hosts.lock().expect("local backend lock poisoned");
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
        let mut hosts = self.hosts.lock().expect("local backend lock poisoned");
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags.retain(|t| !tags.contains(t));
        Ok(())
    }

    async fn set_host_tags(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut hosts = self.hosts.lock().expect("local backend lock poisoned");
        let record = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    async fn on_connection_error(&self, _id: &HostId) {
        // The local machine is always reachable; nothing to degrade.
    }

    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        Ok(Arc::new(LocalHost::new(
            self.host_dir(id),
            format!("mngr-{}", id.as_str()),
        )))
    }
}

impl LocalBackend {
    fn set_state(&self, id: &HostId, state: HostState) -> MngrResult<()> {
        let mut hosts = self.hosts.lock().expect("local backend lock poisoned");
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
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(dir.path().to_path_buf());
        let name = HostName::new("my-host").unwrap();
        let record = backend
            .create_host(&name, HostCreateOptions::default())
            .await
            .unwrap();
        assert_eq!(record.state, HostState::Running);

        let by_id = backend.get_host(record.id.as_str()).await.unwrap();
        assert_eq!(by_id.id, record.id);
        let by_name = backend.get_host("my-host").await.unwrap();
        assert_eq!(by_name.id, record.id);
    }

    #[tokio::test]
    async fn list_hosts_excludes_destroyed_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(dir.path().to_path_buf());
        let name = HostName::new("h").unwrap();
        let record = backend
            .create_host(&name, HostCreateOptions::default())
            .await
            .unwrap();
        backend.destroy_host(&record.id).await.unwrap();

        let visible = backend
            .list_hosts(&ConcurrencyGroup::new(), false)
            .await
            .unwrap();
        assert!(visible.is_empty());

        let all = backend
            .list_hosts(&ConcurrencyGroup::new(), true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn tags_can_be_added_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::with_base_dir(dir.path().to_path_buf());
        let name = HostName::new("h").unwrap();
        let record = backend
            .create_host(&name, HostCreateOptions::default())
            .await
            .unwrap();
        backend
            .add_tags_to_host(&record.id, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(
            backend.get_host_tags(&record.id).await.unwrap().len(),
            2
        );
        backend
            .remove_tags_from_host(&record.id, &["a".to_string()])
            .await
            .unwrap();
        assert_eq!(backend.get_host_tags(&record.id).await.unwrap(), vec!["b"]);
    }
}
