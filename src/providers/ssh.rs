//! SSH provider backend (spec §4.4/§4.5): each entry in `[hosts.<name>]` of
//! the provider config is an always-online host reached over `ssh`. There is
//! no "create"/"destroy" lifecycle to manage remotely — these hosts are
//! externally provisioned — so those operations are no-ops that just flip
//! the locally tracked state, mirroring how the local backend tracks state
//! for a machine it doesn't actually start or stop. `connect()` shells out to
//! the real `ssh` binary for every `HostInterface` operation, the same
//! "spawn a process, stream its output" idiom `LocalHost::tmux` uses for
//! local tmux invocations (`mngr::host::HostInterface`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::concurrency::{ConcurrencyGroup, ConcurrencyGroupError};
use crate::error::{MngrError, MngrResult};
use crate::host::{shell_quote, CommandOutcome, HostInterface};
use crate::models::{HostRecord, HostState};
use crate::primitives::{HostId, HostName, ProviderBackendName, ProviderInstanceName};

use super::{HostCreateOptions, HostResources, ProviderBackendInterface};

#[derive(Debug, Clone)]
pub struct SshHostConfig {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    /// Absolute path on the remote host under which agent state lives.
    /// Defaults to `/home/<user>/.mngr` when not given.
    pub remote_base_dir: Option<String>,
}

impl SshHostConfig {
    fn base_dir(&self) -> String {
        self.remote_base_dir
            .clone()
            .unwrap_or_else(|| format!("/home/{}/.mngr", self.user))
    }
}

pub struct SshBackend {
    hosts: RwLock<HashMap<HostId, (HostRecord, SshHostConfig)>>,
}

impl SshBackend {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Register a configured `[hosts.<name>]` entry as a known host,
    /// reachable immediately (no remote provisioning step).
    pub async fn register_configured_host(&self, name: &HostName, config: SshHostConfig) -> HostId {
        let id = HostId::new_random();
        let record = HostRecord {
            id: id.clone(),
            name: name.clone(),
            provider_name: ProviderInstanceName::new("ssh").expect("static name is valid"),
            state: HostState::Running,
            state_since: chrono::Utc::now(),
            snapshots: Vec::new(),
            tags: Vec::new(),
            plugin_data: HashMap::new(),
        };
        self.hosts.write().await.insert(id.clone(), (record, config));
        id
    }
}

impl Default for SshBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderBackendInterface for SshBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::Ssh
    }

    async fn list_hosts(
        &self,
        _cg: &ConcurrencyGroup,
        include_destroyed: bool,
    ) -> MngrResult<Vec<HostRecord>> {
        let hosts = self.hosts.read().await;
        Ok(hosts
            .values()
            .map(|(r, _)| r)
            .filter(|r| include_destroyed || r.state != HostState::Destroyed)
            .cloned()
            .collect())
    }

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord> {
        let hosts = self.hosts.read().await;
        if let Ok(id) = identifier.parse::<HostId>() {
            if let Some((record, _)) = hosts.get(&id) {
                return Ok(record.clone());
            }
        }
        hosts
            .values()
            .map(|(r, _)| r)
            .find(|r| r.name.as_str() == identifier)
            .cloned()
            .ok_or_else(|| MngrError::HostNotFound(identifier.to_string()))
    }

    async fn create_host(
        &self,
        _name: &HostName,
        _options: HostCreateOptions,
    ) -> MngrResult<HostRecord> {
        Err(MngrError::UserInput(
            "ssh hosts are externally provisioned via [hosts.<name>] config entries, not created"
                .to_string(),
        ))
    }

    async fn stop_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Stopped).await
    }

    async fn start_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Running).await
    }

    async fn destroy_host(&self, id: &HostId) -> MngrResult<()> {
        self.set_state(id, HostState::Destroyed).await
    }

    async fn rename_host(&self, id: &HostId, new_name: &HostName) -> MngrResult<()> {
        let mut hosts = self.hosts.write().await;
        let (record, _) = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.name = new_name.clone();
        Ok(())
    }

    async fn get_host_resources(&self, _id: &HostId) -> MngrResult<HostResources> {
        Ok(HostResources {
            cpu_count: None,
            memory_bytes: None,
            disk_bytes: None,
        })
    }

    async fn get_host_tags(&self, id: &HostId) -> MngrResult<Vec<String>> {
        let hosts = self.hosts.read().await;
        Ok(hosts
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?
            .0
            .tags
            .clone())
    }

    async fn add_tags_to_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut hosts = self.hosts.write().await;
        let (record, _) = hosts
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
        let mut hosts = self.hosts.write().await;
        let (record, _) = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags.retain(|t| !tags.contains(t));
        Ok(())
    }

    async fn set_host_tags(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut hosts = self.hosts.write().await;
        let (record, _) = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    async fn on_connection_error(&self, id: &HostId) {
        tracing::warn!("ssh host {id} failed to connect; marking capability degraded");
    }

    /// Builds a real SSH-backed [`HostInterface`] and probes reachability
    /// before handing it back — an unreachable or misconfigured host fails
    /// `connect()` rather than silently substituting local execution.
    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        let hosts = self.hosts.read().await;
        let (_, config) = hosts
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        let user_host = format!("{}@{}", config.user, config.hostname);
        let host = SshHost::new(config.clone(), format!("mngr-ssh-{}", id.as_str()));
        drop(hosts);
        host.check_reachable()
            .await
            .map_err(|e| MngrError::HostOffline(format!("{user_host} unreachable: {e}")))?;
        Ok(Arc::new(host))
    }

    fn supports_shutdown_hosts(&self) -> bool {
        false
    }
}

impl SshBackend {
    async fn set_state(&self, id: &HostId, state: HostState) -> MngrResult<()> {
        let mut hosts = self.hosts.write().await;
        let (record, _) = hosts
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.state = state;
        record.state_since = chrono::Utc::now();
        Ok(())
    }
}

/// A host reached by shelling out to `ssh user@host -p port …` for every
/// operation: commands, file I/O (via `base64`-encoded `sh -c` one-liners,
/// since there is no stdin-piping primitive in [`ConcurrencyGroup`]), and
/// tmux session management.
pub struct SshHost {
    config: SshHostConfig,
    remote_host_dir: String,
    tmux_socket_prefix: String,
    group: ConcurrencyGroup,
}

impl SshHost {
    pub fn new(config: SshHostConfig, tmux_socket_prefix: impl Into<String>) -> Self {
        let remote_host_dir = config.base_dir();
        Self {
            config,
            remote_host_dir,
            tmux_socket_prefix: tmux_socket_prefix.into(),
            group: ConcurrencyGroup::new(),
        }
    }

    fn ssh_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=8".to_string(),
            format!("{}@{}", self.config.user, self.config.hostname),
        ]
    }

    async fn run_remote(&self, remote_command: &str, timeout: Option<Duration>) -> MngrResult<CommandOutcome> {
        let mut args = self.ssh_args();
        args.push(remote_command.to_string());
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self
            .group
            .run_process_to_completion("ssh", &args_ref, None, &[], timeout, None::<fn(&str, bool)>)
            .await
            .map_err(|e| match e {
                ConcurrencyGroupError::Timeout { what, elapsed } => MngrError::HostOffline(format!(
                    "{}@{}: timed out waiting for {what} after {elapsed:?}",
                    self.config.user, self.config.hostname
                )),
                other => MngrError::internal(other.to_string()),
            })?;
        Ok(result.into())
    }

    async fn tmux(&self, args: &[&str]) -> MngrResult<CommandOutcome> {
        let joined = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
        self.run_remote(&format!("tmux {joined}"), Some(Duration::from_secs(10))).await
    }

    /// A cheap round-trip the connect path uses to fail fast instead of
    /// deferring a bad host/credential combination to the first real
    /// operation.
    pub async fn check_reachable(&self) -> MngrResult<()> {
        let result = self.run_remote("true", Some(Duration::from_secs(8))).await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "ssh reachability check exited {}: {}",
                result.returncode, result.stderr
            )));
        }
        Ok(())
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}/{}", self.remote_host_dir.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl HostInterface for SshHost {
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> MngrResult<CommandOutcome> {
        let mut remote = String::new();
        if let Some(cwd) = cwd {
            remote.push_str(&format!("cd {} && ", shell_quote(cwd)));
        }
        if !env.is_empty() {
            remote.push_str("env ");
            for (k, v) in env {
                remote.push_str(&format!("{k}={} ", shell_quote(v)));
            }
        }
        remote.push_str(&format!("sh -c {}", shell_quote(command)));
        self.run_remote(&remote, timeout).await
    }

    async fn write_text_file(&self, path: &str, content: &str) -> MngrResult<()> {
        let full = self.remote_path(path);
        let parent = Path::new(&full)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, content.as_bytes());
        let tmp = format!("{full}.tmp-{}", crate::primitives::random_suffix());
        let remote = format!(
            "mkdir -p {} && printf '%s' {} | base64 -d > {} && mv {} {}",
            shell_quote(&parent),
            shell_quote(&encoded),
            shell_quote(&tmp),
            shell_quote(&tmp),
            shell_quote(&full),
        );
        let result = self.run_remote(&remote, Some(Duration::from_secs(30))).await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to write remote file {path:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> MngrResult<String> {
        let full = self.remote_path(path);
        let result = self
            .run_remote(&format!("cat {}", shell_quote(&full)), Some(Duration::from_secs(30)))
            .await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to read remote file {path:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(result.stdout)
    }

    async fn start_tmux_session(&self, name: &str, command: &str, env: &[(String, String)]) -> MngrResult<()> {
        let mut args = vec![
            "-L".to_string(),
            self.tmux_socket_prefix.clone(),
            "new-session".to_string(),
            "-d".to_string(),
            "-s".to_string(),
            name.to_string(),
        ];
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(command.to_string());
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.tmux(&args_ref).await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to start tmux session {name:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(())
    }

    async fn tmux_session_exists(&self, name: &str) -> MngrResult<bool> {
        let result = self
            .tmux(&["-L", &self.tmux_socket_prefix, "has-session", "-t", name])
            .await?;
        Ok(result.success())
    }

    async fn rename_tmux_session(&self, old_name: &str, new_name: &str) -> MngrResult<()> {
        let new_exists = self.tmux_session_exists(new_name).await?;
        let old_exists = self.tmux_session_exists(old_name).await?;
        if new_exists && !old_exists {
            return Ok(());
        }
        let result = self
            .tmux(&[
                "-L",
                &self.tmux_socket_prefix,
                "rename-session",
                "-t",
                old_name,
                new_name,
            ])
            .await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to rename tmux session {old_name:?} -> {new_name:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(())
    }

    async fn kill_tmux_session(&self, name: &str) -> MngrResult<()> {
        let result = self
            .tmux(&["-L", &self.tmux_socket_prefix, "kill-session", "-t", name])
            .await?;
        if !result.success() && !result.stderr.contains("session not found") {
            return Err(MngrError::internal(format!(
                "failed to kill tmux session {name:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(())
    }

    async fn send_keys(&self, target: &str, text: &str) -> MngrResult<()> {
        let result = self
            .tmux(&[
                "-L",
                &self.tmux_socket_prefix,
                "send-keys",
                "-t",
                target,
                text,
                "Enter",
            ])
            .await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to send keys to {target:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(())
    }

    async fn capture_pane(&self, target: &str) -> MngrResult<String> {
        let result = self
            .tmux(&["-L", &self.tmux_socket_prefix, "capture-pane", "-t", target, "-p"])
            .await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to capture pane {target:?} on {}@{}: {}",
                self.config.user, self.config.hostname, result.stderr
            )));
        }
        Ok(result.stdout)
    }

    fn host_dir(&self) -> &Path {
        // Informational only (trait contract): this is a remote path, not a
        // local one, but nothing dereferences it as a local filesystem path.
        Path::new(&self.remote_host_dir)
    }

    fn is_local(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for SshHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshHost")
            .field("hostname", &self.config.hostname)
            .field("user", &self.config.user)
            .field("port", &self.config.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_dir_defaults_to_user_home() {
        let config = SshHostConfig {
            hostname: "example.test".to_string(),
            user: "agent".to_string(),
            port: 22,
            remote_base_dir: None,
        };
        assert_eq!(config.base_dir(), "/home/agent/.mngr");
    }

    #[test]
    fn base_dir_honors_override() {
        let config = SshHostConfig {
            hostname: "example.test".to_string(),
            user: "agent".to_string(),
            port: 22,
            remote_base_dir: Some("/srv/mngr".to_string()),
        };
        assert_eq!(config.base_dir(), "/srv/mngr");
    }

    #[tokio::test]
    async fn connect_to_unresolvable_host_reports_offline() {
        let backend = SshBackend::new();
        let name = HostName::new("unreachable").unwrap();
        let id = backend
            .register_configured_host(
                &name,
                SshHostConfig {
                    hostname: "mngr-test-host-that-does-not-exist.invalid".to_string(),
                    user: "nobody".to_string(),
                    port: 22,
                    remote_base_dir: None,
                },
            )
            .await;
        let result = backend.connect(&id).await;
        assert!(matches!(result, Err(MngrError::HostOffline(_))));
    }
}
