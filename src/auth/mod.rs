//! File-backed auth store (C8, spec §4.7).
//!
//! Ported line-for-line in idiom from
//! `original_source/.../forwarding_server/auth.py`'s `FileAuthStore`: one
//! JSON document of one-time codes (whole-file atomic rewrite), a signing
//! key file created on first use with mode 0600, an empty key file treated
//! as an error rather than silently regenerated.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MngrError, MngrResult};
use crate::primitives::{AgentId, CookieSigningKey, OneTimeCode};

const SIGNING_KEY_FILENAME: &str = "signing_key";
const CODES_FILENAME: &str = "one_time_codes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OneTimeCodeStatus {
    Valid,
    Used,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOneTimeCode {
    pub code: OneTimeCode,
    pub agent_id: AgentId,
    pub status: OneTimeCodeStatus,
}

pub struct FileAuthStore {
    data_directory: PathBuf,
}

impl FileAuthStore {
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
        }
    }

    fn codes_path(&self) -> PathBuf {
        self.data_directory.join(CODES_FILENAME)
    }

    fn signing_key_path(&self) -> PathBuf {
        self.data_directory.join(SIGNING_KEY_FILENAME)
    }

    async fn load_codes(&self) -> Vec<StoredOneTimeCode> {
        let path = self.codes_path();
        let Ok(raw) = tokio::fs::read_to_string(&path).await else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(codes) => codes,
            Err(e) => {
                tracing::warn!("failed to load codes from {}: {e}", path.display());
                Vec::new()
            }
        }
    }

    async fn save_codes(&self, codes: &[StoredOneTimeCode]) -> MngrResult<()> {
        tokio::fs::create_dir_all(&self.data_directory).await?;
        let path = self.codes_path();
        let tmp = self
            .data_directory
            .join(format!("{CODES_FILENAME}.tmp-{}", crate::primitives::random_suffix()));
        let serialized = serde_json::to_vec_pretty(codes)?;
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn add_one_time_code(&self, agent_id: &AgentId, code: OneTimeCode) -> MngrResult<()> {
        let mut codes = self.load_codes().await;
        codes.push(StoredOneTimeCode {
            code,
            agent_id: agent_id.clone(),
            status: OneTimeCodeStatus::Valid,
        });
        self.save_codes(&codes).await
    }

    /// Returns true exactly once per valid `(agent_id, code)` pair: a second
    /// call, or a call for a different agent with the same code, returns
    /// false (spec P2).
    pub async fn validate_and_consume_code(&self, agent_id: &AgentId, code: &OneTimeCode) -> MngrResult<bool> {
        let mut codes = self.load_codes().await;
        let Some(idx) = codes
            .iter()
            .position(|c| &c.code == code && &c.agent_id == agent_id)
        else {
            tracing::debug!("rejected unknown code for {agent_id}");
            return Ok(false);
        };
        if codes[idx].status != OneTimeCodeStatus::Valid {
            tracing::debug!("rejected already-used code for {agent_id}");
            return Ok(false);
        }
        codes[idx].status = OneTimeCodeStatus::Used;
        self.save_codes(&codes).await?;
        Ok(true)
    }

    /// Returns the persisted signing key, generating (and chmod 0600-ing)
    /// one on first use. An empty key file is an error, not an implicit
    /// regeneration.
    pub async fn get_signing_key(&self) -> MngrResult<CookieSigningKey> {
        let path = self.signing_key_path();
        if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| MngrError::internal(format!("cannot read signing key from {}: {e}", path.display())))?;
            if bytes.is_empty() {
                return Err(MngrError::internal(format!(
                    "signing key file is empty: {}",
                    path.display()
                )));
            }
            return Ok(CookieSigningKey(bytes));
        }

        let new_key = crate::primitives::generate_signing_key_material();
        tokio::fs::create_dir_all(&self.data_directory).await?;
        tokio::fs::write(&path, &new_key).await?;
        set_owner_only_permissions(&path).await?;
        Ok(CookieSigningKey(new_key))
    }

    pub async fn list_agent_ids_with_valid_codes(&self) -> Vec<AgentId> {
        let codes = self.load_codes().await;
        let mut ids: Vec<String> = codes
            .iter()
            .filter(|c| c.status == OneTimeCodeStatus::Valid)
            .map(|c| c.agent_id.to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().filter_map(|s| s.parse().ok()).collect()
    }
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) -> MngrResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) -> MngrResult<()> {
    Ok(())
}
