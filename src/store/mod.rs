//! Per-host agent store (C4, spec §4.3).
//!
//! CRUD organization mirrors `RactorLabs-ractor`'s `shared/models::Agent` (a
//! `find_by_name`/`create`/`update`/`delete` inherent-impl cluster) but reads
//! and writes JSON documents under `<host_dir>/agents/<id>/data.json` via
//! atomic temp-file-then-rename instead of `sqlx` rows, and the completion
//! cache format is taken directly from
//! `original_source/libs/mng/imbue/mng/utils/agent_cache.py`.

pub mod cache;

use std::path::{Path, PathBuf};

use crate::error::{MngrError, MngrResult};
use crate::models::AgentRecord;
use crate::primitives::{AgentId, AgentName};

pub struct AgentStore {
    host_dir: PathBuf,
}

impl AgentStore {
    pub fn new(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
        }
    }

    fn agent_dir(&self, id: &AgentId) -> PathBuf {
        self.host_dir.join("agents").join(id.as_str())
    }

    fn data_path(&self, id: &AgentId) -> PathBuf {
        self.agent_dir(id).join("data.json")
    }

    /// List every agent record under this host. Per spec P8, an entry whose
    /// `data.json` is missing or malformed is skipped with a warning rather
    /// than failing the whole listing.
    pub async fn list_agents(&self) -> MngrResult<Vec<AgentRecord>> {
        let agents_dir = self.host_dir.join("agents");
        if !agents_dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let data_path = entry.path().join("data.json");
            match tokio::fs::read(&data_path).await {
                Ok(bytes) => match serde_json::from_slice::<AgentRecord>(&bytes) {
                    Ok(record) => {
                        if record.id.as_str() != dir_name {
                            tracing::warn!(
                                "skipping agent record at {dir_name}: id {} does not match directory name",
                                record.id
                            );
                            continue;
                        }
                        out.push(record);
                    }
                    Err(e) => {
                        tracing::warn!("skipping malformed agent record at {dir_name}: {e}");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("skipping agent directory {dir_name}: missing data.json");
                }
                Err(e) => {
                    tracing::warn!("skipping agent directory {dir_name}: {e}");
                }
            }
        }
        out.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(out)
    }

    pub async fn read_agent(&self, id: &AgentId) -> MngrResult<AgentRecord> {
        let path = self.data_path(id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MngrError::AgentNotFound(id.to_string())
            } else {
                MngrError::Io(e)
            }
        })?;
        let record: AgentRecord = serde_json::from_slice(&bytes)?;
        Ok(record)
    }

    /// Whole-record rewrite via atomic temp-file-then-rename, per the data
    /// model's "immutable in spirit" invariant.
    pub async fn write_agent(&self, record: &AgentRecord) -> MngrResult<()> {
        let dir = self.agent_dir(&record.id);
        tokio::fs::create_dir_all(&dir).await?;
        let data_path = dir.join("data.json");
        let tmp_path = dir.join(format!("data.json.tmp-{}", crate::primitives::random_suffix()));
        let bytes = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &data_path).await?;
        Ok(())
    }

    pub async fn delete_agent(&self, id: &AgentId) -> MngrResult<()> {
        let dir = self.agent_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MngrError::Io(e)),
        }
    }

    /// Resolve a user-supplied string to a single agent by id or by name;
    /// raises on ambiguity (more than one agent sharing that name).
    pub async fn resolve_by_name_or_id(&self, identifier: &str) -> MngrResult<AgentRecord> {
        if let Ok(id) = identifier.parse::<AgentId>() {
            if let Ok(record) = self.read_agent(&id).await {
                return Ok(record);
            }
        }
        let name = AgentName::new(identifier)?;
        let matches: Vec<AgentRecord> = self
            .list_agents()
            .await?
            .into_iter()
            .filter(|r| r.name == name)
            .collect();
        match matches.len() {
            0 => Err(MngrError::AgentNotFound(identifier.to_string())),
            1 => Ok(matches.into_iter().next().unwrap()),
            _ => Err(MngrError::UserInput(format!(
                "agent name {identifier:?} is ambiguous: {} matches",
                matches.len()
            ))),
        }
    }

    pub fn activity_ssh_path(&self, id: &AgentId) -> PathBuf {
        self.agent_dir(id).join("activity").join("ssh")
    }

    pub fn signal_path(&self, session_name: &str) -> PathBuf {
        self.host_dir.join("signals").join(session_name)
    }

    pub fn host_dir(&self) -> &Path {
        &self.host_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentState, HostRef};
    use crate::primitives::{HostId, HostName, ProviderInstanceName};
    use chrono::Utc;

    fn sample_record(name: &str) -> AgentRecord {
        AgentRecord {
            id: AgentId::new_random(),
            name: AgentName::new(name).unwrap(),
            agent_type: "generic".to_string(),
            command: "bash".to_string(),
            work_dir: "/tmp".to_string(),
            create_time: Utc::now(),
            labels: Default::default(),
            start_on_boot: false,
            host_ref: HostRef {
                host_id: HostId::new_random(),
                host_name: HostName::new("h1").unwrap(),
                provider_name: ProviderInstanceName::new("local").unwrap(),
            },
            state: AgentState::Creating,
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        let record = sample_record("test-a");
        store.write_agent(&record).await.unwrap();
        let read_back = store.read_agent(&record.id).await.unwrap();
        assert_eq!(read_back.id, record.id);
        assert_eq!(read_back.name, record.name);
    }

    #[tokio::test]
    async fn list_agents_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        let good = sample_record("good");
        store.write_agent(&good).await.unwrap();

        let bad_dir = dir.path().join("agents").join("agent-deadbeefdeadbeefdeadbeefdeadbeef");
        tokio::fs::create_dir_all(&bad_dir).await.unwrap();
        tokio::fs::write(bad_dir.join("data.json"), b"not json")
            .await
            .unwrap();

        let listed = store.list_agents().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
    }

    #[tokio::test]
    async fn resolve_by_name_or_id_detects_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        let a = sample_record("dup");
        let b = sample_record("dup");
        store.write_agent(&a).await.unwrap();
        store.write_agent(&b).await.unwrap();
        let result = store.resolve_by_name_or_id("dup").await;
        assert!(matches!(result, Err(MngrError::UserInput(_))));
    }

    #[tokio::test]
    async fn resolve_by_name_or_id_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        let result = store.resolve_by_name_or_id("missing").await;
        assert!(matches!(result, Err(MngrError::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn delete_agent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentStore::new(dir.path());
        let record = sample_record("to-delete");
        store.write_agent(&record).await.unwrap();
        store.delete_agent(&record.id).await.unwrap();
        store.delete_agent(&record.id).await.unwrap();
        assert!(matches!(
            store.read_agent(&record.id).await,
            Err(MngrError::AgentNotFound(_))
        ));
    }
}
