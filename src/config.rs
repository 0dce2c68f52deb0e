//! TOML configuration loader (C12 / spec §6).
//!
//! Follows the load-path resolution shape of
//! `RactorLabs-ractor/src/shared/config.rs` (`resolve_config_path` /
//! `load_from_path` / `load_default`, `~` expansion, env var override) but
//! parses TOML via the `toml` crate instead of `serde_json`, since spec.md
//! §6 specifies a TOML configuration file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{MngrError, MngrResult};
use crate::primitives::ProviderBackendName;

#[derive(Debug, Clone, Deserialize)]
pub struct MngrConfig {
    #[serde(default = "default_host_dir")]
    pub default_host_dir: PathBuf,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default = "default_enabled_backends")]
    pub enabled_backends: Vec<ProviderBackendName>,

    #[serde(default)]
    pub disabled_plugins: Vec<String>,

    #[serde(default)]
    pub providers: HashMap<String, ProviderConfigEntry>,

    #[serde(default)]
    pub agent_types: HashMap<String, AgentTypeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfigEntry {
    pub backend: ProviderBackendName,
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentTypeConfig {
    pub command: String,
    #[serde(default)]
    pub cli_args: Vec<String>,
}

fn default_host_dir() -> PathBuf {
    PathBuf::from("~/.mngr")
}

fn default_prefix() -> String {
    "mngr-".to_string()
}

fn default_enabled_backends() -> Vec<ProviderBackendName> {
    vec![ProviderBackendName::Local]
}

impl MngrConfig {
    pub fn load_from_path(path: &Path) -> MngrResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MngrError::Config(format!("failed to read config at {}: {e}", path.display()))
        })?;
        let raw: toml::Table = toml::from_str(&data).map_err(|e| {
            MngrError::Config(format!("failed to parse TOML at {}: {e}", path.display()))
        })?;
        reject_unknown_top_level_keys(&raw);
        let config: MngrConfig = raw.try_into().map_err(|e: toml::de::Error| {
            MngrError::Config(format!("invalid config at {}: {e}", path.display()))
        })?;
        Ok(config)
    }

    pub fn load_default() -> MngrResult<(Self, PathBuf)> {
        let path = resolve_config_path();
        if !path.exists() {
            return Ok((
                MngrConfig {
                    default_host_dir: expand_path(default_host_dir().to_string_lossy().into()),
                    prefix: default_prefix(),
                    enabled_backends: default_enabled_backends(),
                    disabled_plugins: Vec::new(),
                    providers: HashMap::new(),
                    agent_types: HashMap::new(),
                },
                path,
            ));
        }
        let mut config = Self::load_from_path(&path)?;
        config.default_host_dir =
            expand_path(config.default_host_dir.to_string_lossy().into());
        Ok((config, path))
    }
}

/// Unknown top-level keys warn and are ignored (spec §6); unknown provider
/// keys, by contrast, are rejected by `ProviderConfigEntry`'s strict struct.
fn reject_unknown_top_level_keys(raw: &toml::Table) {
    const KNOWN: &[&str] = &[
        "default_host_dir",
        "prefix",
        "enabled_backends",
        "disabled_plugins",
        "providers",
        "agent_types",
    ];
    for key in raw.keys() {
        if !KNOWN.contains(&key.as_str()) {
            tracing::warn!("ignoring unknown top-level config key: {key}");
        }
    }
}

pub fn resolve_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("MNGR_CONFIG_PATH") {
        return expand_path(path);
    }
    default_config_path()
}

fn expand_path(input: String) -> PathBuf {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(input)
}

fn default_config_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mngr")
        .join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            prefix = "mngr-"

            [providers.local]
            backend = "local"

            [agent_types.generic]
            command = "bash"
            "#,
        )
        .unwrap();
        let config = MngrConfig::load_from_path(&path).unwrap();
        assert_eq!(config.prefix, "mngr-");
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.agent_types["generic"].command, "bash");
    }
}
