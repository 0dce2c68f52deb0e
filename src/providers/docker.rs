//! Docker provider backend (spec §4.5): runs a "state container" per host
//! from a small Alpine image; reads/writes hit that container via `exec`.
//! Grounded on `RactorLabs-ractor`'s `docker_manager.rs`-style use of
//! `bollard` for container lifecycle (create/start/stop/remove, exec).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::RwLock;

use crate::concurrency::ConcurrencyGroup;
use crate::error::{MngrError, MngrResult};
use crate::host::{shell_quote, CommandOutcome, HostInterface};
use crate::models::{HostRecord, HostState};
use crate::primitives::{HostId, HostName, ProviderBackendName, ProviderInstanceName};

use super::{HostCreateOptions, HostResources, ProviderBackendInterface};

const DEFAULT_IMAGE: &str = "alpine:latest";
const LABEL_MNGR_HOST_ID: &str = "mngr.host_id";
const LABEL_MNGR_HOST_NAME: &str = "mngr.host_name";
const CONTAINER_HOST_DIR: &str = "/mngr-state";

pub struct DockerBackend {
    client: RwLock<Option<Arc<Docker>>>,
    known: RwLock<HashMap<HostId, HostRecord>>,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            client: RwLock::new(None),
            known: RwLock::new(HashMap::new()),
        }
    }

    /// Connect to the local Docker daemon, or report it as absent rather
    /// than failing — unreachable backends surface `capability = false`
    /// instead of raising at load time (spec §4.5).
    async fn client(&self) -> MngrResult<Arc<Docker>> {
        if let Some(client) = self.client.read().await.clone() {
            return Ok(client);
        }
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| MngrError::provider_degraded(None, format!("docker unreachable: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| MngrError::provider_degraded(None, format!("docker ping failed: {e}")))?;
        let client = Arc::new(docker);
        *self.client.write().await = Some(client.clone());
        Ok(client)
    }

    fn container_name(id: &HostId) -> String {
        format!("mngr-host-{}", id.as_str())
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderBackendInterface for DockerBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::Docker
    }

    async fn list_hosts(
        &self,
        _cg: &ConcurrencyGroup,
        include_destroyed: bool,
    ) -> MngrResult<Vec<HostRecord>> {
        let docker = self.client().await?;
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_MNGR_HOST_ID.to_string()]);
        let containers = docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| MngrError::provider_degraded(None, e.to_string()))?;

        let known = self.known.read().await;
        let mut out = Vec::new();
        for container in containers {
            let labels = container.labels.unwrap_or_default();
            let Some(id_str) = labels.get(LABEL_MNGR_HOST_ID) else {
                continue;
            };
            let Ok(id) = id_str.parse::<HostId>() else {
                continue;
            };
            if let Some(record) = known.get(&id) {
                if include_destroyed || record.state != HostState::Destroyed {
                    out.push(record.clone());
                }
            }
        }
        Ok(out)
    }

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord> {
        let known = self.known.read().await;
        if let Ok(id) = identifier.parse::<HostId>() {
            if let Some(record) = known.get(&id) {
                return Ok(record.clone());
            }
        }
        known
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
        let docker = self.client().await?;
        let id = HostId::new_random();
        let container_name = Self::container_name(&id);
        let image = options.image.clone().unwrap_or_else(|| DEFAULT_IMAGE.to_string());

        let mut labels = HashMap::new();
        labels.insert(LABEL_MNGR_HOST_ID.to_string(), id.as_str().to_string());
        labels.insert(LABEL_MNGR_HOST_NAME.to_string(), name.as_str().to_string());

        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(image),
                    cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    labels: Some(labels),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MngrError::provider_fatal(None, e.to_string()))?;

        docker
            .start_container::<String>(&container_name, None)
            .await
            .map_err(|e| MngrError::provider_fatal(None, e.to_string()))?;

        let record = HostRecord {
            id: id.clone(),
            name: name.clone(),
            provider_name: ProviderInstanceName::new("docker")?,
            state: HostState::Running,
            state_since: chrono::Utc::now(),
            snapshots: Vec::new(),
            tags: options.tags,
            plugin_data: HashMap::new(),
        };
        self.known.write().await.insert(id, record.clone());
        Ok(record)
    }

    async fn stop_host(&self, id: &HostId) -> MngrResult<()> {
        let docker = self.client().await?;
        docker
            .stop_container(&Self::container_name(id), Some(StopContainerOptions { t: 10 }))
            .await
            .map_err(|e| MngrError::provider_degraded(Some(id.to_string()), e.to_string()))?;
        self.set_state(id, HostState::Stopped).await
    }

    async fn start_host(&self, id: &HostId) -> MngrResult<()> {
        let docker = self.client().await?;
        docker
            .start_container::<String>(&Self::container_name(id), None)
            .await
            .map_err(|e| MngrError::provider_degraded(Some(id.to_string()), e.to_string()))?;
        self.set_state(id, HostState::Running).await
    }

    async fn destroy_host(&self, id: &HostId) -> MngrResult<()> {
        let docker = self.client().await?;
        docker
            .remove_container(
                &Self::container_name(id),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| MngrError::provider_degraded(Some(id.to_string()), e.to_string()))?;
        self.set_state(id, HostState::Destroyed).await
    }

    async fn rename_host(&self, id: &HostId, new_name: &HostName) -> MngrResult<()> {
        let mut known = self.known.write().await;
        let record = known
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
        let known = self.known.read().await;
        Ok(known
            .get(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?
            .tags
            .clone())
    }

    async fn add_tags_to_host(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut known = self.known.write().await;
        let record = known
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
        let mut known = self.known.write().await;
        let record = known
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags.retain(|t| !tags.contains(t));
        Ok(())
    }

    async fn set_host_tags(&self, id: &HostId, tags: &[String]) -> MngrResult<()> {
        let mut known = self.known.write().await;
        let record = known
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    async fn on_connection_error(&self, id: &HostId) {
        *self.client.write().await = None;
        let mut known = self.known.write().await;
        if let Some(record) = known.get_mut(id) {
            tracing::warn!("marking docker host {id} degraded after connection error");
            let _ = record;
        }
    }

    /// Builds a [`DockerHost`] that drives the already-running state
    /// container through `bollard::exec`, instead of handing back a
    /// [`crate::host::LocalHost`] that would bypass the container entirely.
    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        let docker = self.client().await?;
        Ok(Arc::new(DockerHost::new(
            docker,
            Self::container_name(id),
            PathBuf::from(CONTAINER_HOST_DIR),
        )))
    }

    fn supports_volumes(&self) -> bool {
        true
    }
}

impl DockerBackend {
    async fn set_state(&self, id: &HostId, state: HostState) -> MngrResult<()> {
        let mut known = self.known.write().await;
        let record = known
            .get_mut(id)
            .ok_or_else(|| MngrError::HostNotFound(id.to_string()))?;
        record.state = state;
        record.state_since = chrono::Utc::now();
        Ok(())
    }
}

/// A host reached by running `bollard::exec` inside an already-running
/// container: commands, file I/O (via `base64`-encoded `sh -c` one-liners,
/// the same technique [`crate::providers::ssh::SshHost`] uses over SSH), and
/// tmux session management.
pub struct DockerHost {
    client: Arc<Docker>,
    container_name: String,
    host_dir: PathBuf,
    tmux_socket_prefix: String,
}

impl DockerHost {
    pub fn new(client: Arc<Docker>, container_name: String, host_dir: PathBuf) -> Self {
        let tmux_socket_prefix = format!("mngr-docker-{container_name}");
        Self {
            client,
            container_name,
            host_dir,
            tmux_socket_prefix,
        }
    }

    /// Runs `sh -c <command>` inside the container and collects its full
    /// stdout/stderr/exit code.
    async fn exec_sh(&self, command: &str) -> MngrResult<CommandOutcome> {
        self.exec(vec!["sh".to_string(), "-c".to_string(), command.to_string()], &[])
            .await
    }

    async fn exec(&self, cmd: Vec<String>, env: &[String]) -> MngrResult<CommandOutcome> {
        let exec = self
            .client
            .create_exec(
                &self.container_name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: if env.is_empty() { None } else { Some(env.to_vec()) },
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MngrError::internal(format!("docker exec create failed: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| MngrError::internal(format!("docker exec start failed: {e}")))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(|e| MngrError::internal(format!("docker exec stream error: {e}")))? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::Console { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| MngrError::internal(format!("docker exec inspect failed: {e}")))?;
        let returncode = inspect.exit_code.unwrap_or(0) as i32;

        Ok(CommandOutcome {
            returncode,
            stdout,
            stderr,
        })
    }

    async fn tmux(&self, args: &[&str]) -> MngrResult<CommandOutcome> {
        let mut cmd = vec!["tmux".to_string()];
        cmd.extend(args.iter().map(|a| a.to_string()));
        self.exec(cmd, &[]).await
    }

    fn remote_path(&self, path: &str) -> String {
        format!("{}/{}", self.host_dir.to_string_lossy().trim_end_matches('/'), path)
    }
}

#[async_trait]
impl HostInterface for DockerHost {
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
        remote.push_str(&format!("sh -c {}", shell_quote(command)));
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let fut = self.exec(vec!["sh".to_string(), "-c".to_string(), remote], &env);
        match timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| {
                MngrError::internal(format!(
                    "timed out waiting for exec in container {} after {t:?}",
                    self.container_name
                ))
            })?,
            None => fut.await,
        }
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
        let result = self.exec_sh(&remote).await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to write file {path:?} in container {}: {}",
                self.container_name, result.stderr
            )));
        }
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> MngrResult<String> {
        let full = self.remote_path(path);
        let result = self.exec_sh(&format!("cat {}", shell_quote(&full))).await?;
        if !result.success() {
            return Err(MngrError::internal(format!(
                "failed to read file {path:?} in container {}: {}",
                self.container_name, result.stderr
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
                "failed to start tmux session {name:?} in container {}: {}",
                self.container_name, result.stderr
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
                "failed to rename tmux session {old_name:?} -> {new_name:?} in container {}: {}",
                self.container_name, result.stderr
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
                "failed to kill tmux session {name:?} in container {}: {}",
                self.container_name, result.stderr
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
                "failed to send keys to {target:?} in container {}: {}",
                self.container_name, result.stderr
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
                "failed to capture pane {target:?} in container {}: {}",
                self.container_name, result.stderr
            )));
        }
        Ok(result.stdout)
    }

    fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    fn is_local(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_prefixed_with_host_id() {
        let id = HostId::new_random();
        let name = DockerBackend::container_name(&id);
        assert!(name.starts_with("mngr-host-"));
        assert!(name.ends_with(id.as_str()));
    }

    #[test]
    fn remote_path_joins_host_dir_and_relative_path() {
        let docker = DockerHost {
            client: unreachable_client(),
            container_name: "mngr-host-test".to_string(),
            host_dir: PathBuf::from("/mngr-state"),
            tmux_socket_prefix: "mngr-docker-test".to_string(),
        };
        assert_eq!(docker.remote_path("notes/a.txt"), "/mngr-state/notes/a.txt");
    }

    /// A `Docker` handle that is never dialed; safe to construct for tests
    /// that only exercise pure path-joining logic.
    fn unreachable_client() -> Arc<Docker> {
        Arc::new(Docker::connect_with_local_defaults().expect("docker client construction does not dial"))
    }
}
