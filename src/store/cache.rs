//! Name/ID completion cache (supplemented feature; spec.md footnotes this as
//! "Name-index shortcut"). Grounded line-for-line on
//! `original_source/libs/mng/imbue/mng/utils/agent_cache.py`: a best-effort
//! JSON file under a tmp-style cache directory, tolerant of being missing or
//! corrupt, written atomically, read back without touching the config system.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::primitives::{AgentId, AgentName, HostId, HostName, ProviderInstanceName};

const CACHE_FILENAME: &str = ".agent_completions.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub id: String,
    pub provider: String,
    pub host_name: String,
    pub host_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    agents: Vec<AgentSummary>,
    names: Vec<String>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// `MNGR_COMPLETION_CACHE_DIR` if set, else a uid-namespaced path under the
/// system temp directory, created on demand.
pub fn completion_cache_dir() -> PathBuf {
    let dir = if let Ok(env_dir) = std::env::var("MNGR_COMPLETION_CACHE_DIR") {
        PathBuf::from(env_dir)
    } else {
        let uid = unsafe { libc_getuid() };
        std::env::temp_dir().join(format!("mngr-completions-{uid}"))
    };
    let _ = std::fs::create_dir_all(&dir);
    dir
}

// Avoid a hard `libc` dependency for a single syscall: fall back to 0 (a
// valid, if non-unique, namespace) on platforms where getuid isn't wired up.
#[cfg(unix)]
unsafe fn libc_getuid() -> u32 {
    extern "C" {
        fn getuid() -> u32;
    }
    getuid()
}

#[cfg(not(unix))]
unsafe fn libc_getuid() -> u32 {
    0
}

pub struct HostAgents {
    pub host_id: HostId,
    pub host_name: HostName,
    pub provider_name: ProviderInstanceName,
    pub agents: Vec<(AgentId, AgentName)>,
}

/// Best-effort write: filesystem failures are swallowed, matching the
/// Python original's `except OSError: logger.debug(...)`.
pub async fn write_agent_names_cache(cache_dir: &Path, agents_by_host: &[HostAgents]) {
    let mut entries = Vec::new();
    for host in agents_by_host {
        for (agent_id, agent_name) in &host.agents {
            entries.push(AgentSummary {
                name: agent_name.as_str().to_string(),
                id: agent_id.as_str().to_string(),
                provider: host.provider_name.as_str().to_string(),
                host_name: host.host_name.as_str().to_string(),
                host_id: host.host_id.as_str().to_string(),
            });
        }
    }
    let mut names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    names.dedup();

    let cache = CacheFile {
        agents: entries,
        names,
        updated_at: chrono::Utc::now(),
    };

    let path = cache_dir.join(CACHE_FILENAME);
    let result: std::io::Result<()> = async {
        let bytes = serde_json::to_vec(&cache).map_err(std::io::Error::other)?;
        let tmp = cache_dir.join(format!("{CACHE_FILENAME}.tmp-{}", crate::primitives::random_suffix()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
    .await;
    if let Err(e) = result {
        tracing::debug!("failed to write agent name completion cache: {e}");
    }
}

/// Resolve every identifier (by name or id) against the cache. Returns
/// `None` if the cache is missing/corrupt, or if any identifier can't be
/// resolved — callers fall back to a live lookup in that case.
pub async fn resolve_identifiers_from_cache(
    cache_dir: &Path,
    identifiers: &[String],
) -> Option<Vec<AgentSummary>> {
    let path = cache_dir.join(CACHE_FILENAME);
    let raw = tokio::fs::read(&path).await.ok()?;
    let cache: CacheFile = serde_json::from_slice(&raw).ok()?;

    let mut by_name: HashMap<&str, Vec<&AgentSummary>> = HashMap::new();
    let mut by_id: HashMap<&str, Vec<&AgentSummary>> = HashMap::new();
    for entry in &cache.agents {
        by_name.entry(&entry.name).or_default().push(entry);
        by_id.entry(&entry.id).or_default().push(entry);
    }

    let mut matched = Vec::new();
    for identifier in identifiers {
        let name_matches = by_name.get(identifier.as_str());
        let id_matches = by_id.get(identifier.as_str());
        if name_matches.is_none() && id_matches.is_none() {
            return None;
        }
        if let Some(m) = name_matches {
            matched.extend(m.iter().map(|e| (*e).clone()));
        }
        if let Some(m) = id_matches {
            matched.extend(m.iter().map(|e| (*e).clone()));
        }
    }
    Some(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(name: &str, provider: &str, agent_names: &[&str]) -> HostAgents {
        HostAgents {
            host_id: HostId::new_random(),
            host_name: HostName::new(name).unwrap(),
            provider_name: ProviderInstanceName::new(provider).unwrap(),
            agents: agent_names
                .iter()
                .map(|n| (AgentId::new_random(), AgentName::new(*n).unwrap()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn write_then_resolve_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let h = host("host-one", "local", &["agent-one"]);
        let agent_id = h.agents[0].0.as_str().to_string();
        let agent_name = h.agents[0].1.as_str().to_string();
        write_agent_names_cache(dir.path(), &[h]).await;

        let by_name = resolve_identifiers_from_cache(dir.path(), &[agent_name.clone()])
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, agent_id);

        let by_id = resolve_identifiers_from_cache(dir.path(), &[agent_id])
            .await
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].name, agent_name);
    }

    #[tokio::test]
    async fn resolve_returns_none_for_unknown_identifier() {
        let dir = tempfile::tempdir().unwrap();
        write_agent_names_cache(dir.path(), &[]).await;
        let result = resolve_identifiers_from_cache(dir.path(), &["nope".to_string()]).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn resolve_returns_none_when_cache_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = resolve_identifiers_from_cache(dir.path(), &["anything".to_string()]).await;
        assert!(result.is_none());
    }
}
