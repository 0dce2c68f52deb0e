//! Backend resolver (C9, spec §4.8): a single JSON file mapping agent id to
//! the URL the proxy should route to. Atomic whole-file replacement,
//! last-writer-wins — registrations are idempotent so that policy is safe.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::MngrResult;
use crate::primitives::AgentId;

const BACKENDS_FILENAME: &str = "backends.json";

pub struct BackendResolver {
    data_dir: PathBuf,
}

impl BackendResolver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    fn path(&self) -> PathBuf {
        self.data_dir.join(BACKENDS_FILENAME)
    }

    /// Corrupt or missing file reads back as an empty map, never an error.
    async fn load(&self) -> HashMap<String, String> {
        let Ok(raw) = tokio::fs::read_to_string(self.path()).await else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    async fn save(&self, entries: &HashMap<String, String>) -> MngrResult<()> {
        tokio::fs::create_dir_all(&self.data_dir).await?;
        let tmp = self
            .data_dir
            .join(format!("{BACKENDS_FILENAME}.tmp-{}", crate::primitives::random_suffix()));
        let bytes = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.path()).await?;
        Ok(())
    }

    pub async fn register_backend(&self, agent_id: &AgentId, url: &str) -> MngrResult<()> {
        let mut entries = self.load().await;
        entries.insert(agent_id.to_string(), url.to_string());
        self.save(&entries).await
    }

    pub async fn deregister_backend(&self, agent_id: &AgentId) -> MngrResult<()> {
        let mut entries = self.load().await;
        entries.remove(agent_id.as_str());
        self.save(&entries).await
    }

    pub async fn get_backend_url(&self, agent_id: &AgentId) -> Option<String> {
        self.load().await.get(agent_id.as_str()).cloned()
    }

    pub async fn list_known_agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .load()
            .await
            .keys()
            .filter_map(|s| s.parse().ok())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = BackendResolver::new(dir.path());
        let agent = AgentId::new_random();
        resolver.register_backend(&agent, "http://127.0.0.1:9000").await.unwrap();
        assert_eq!(
            resolver.get_backend_url(&agent).await,
            Some("http://127.0.0.1:9000".to_string())
        );
    }

    #[tokio::test]
    async fn corrupt_file_reads_back_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(BACKENDS_FILENAME), b"not json")
            .await
            .unwrap();
        let resolver = BackendResolver::new(dir.path());
        assert!(resolver.list_known_agent_ids().await.is_empty());
    }

    #[tokio::test]
    async fn deregister_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = BackendResolver::new(dir.path());
        let agent = AgentId::new_random();
        resolver.register_backend(&agent, "http://x").await.unwrap();
        resolver.deregister_backend(&agent).await.unwrap();
        assert_eq!(resolver.get_backend_url(&agent).await, None);
    }

    #[tokio::test]
    async fn list_known_agent_ids_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = BackendResolver::new(dir.path());
        let a = AgentId::new_random();
        let b = AgentId::new_random();
        resolver.register_backend(&a, "http://a").await.unwrap();
        resolver.register_backend(&b, "http://b").await.unwrap();
        let ids = resolver.list_known_agent_ids().await;
        assert_eq!(ids.len(), 2);
        assert!(ids[0].as_str() <= ids[1].as_str());
    }
}
