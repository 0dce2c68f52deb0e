//! Host & connector (C5, spec §4.4): the set of operations available on an
//! online host — run a command, read/write files, and drive a tmux session.
//!
//! `RactorLabs-ractor` talks to hosts only through its sandbox/docker managers; the
//! "connector" shape here (a trait implemented once per transport) follows
//! that same seam, generalized to local execution today and to SSH/Docker
//! exec tomorrow (C6 providers each construct a `HostInterface`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::concurrency::{ConcurrencyGroup, ProcessResult};
use crate::error::{MngrError, MngrResult};

/// Single-quote `value` for inclusion in a remote `sh -c` command line (SSH,
/// docker exec): used wherever a connector builds a command string instead of
/// passing an argv vector to the transport directly.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

impl From<ProcessResult> for CommandOutcome {
    fn from(result: ProcessResult) -> Self {
        Self {
            returncode: result.returncode,
            stdout: result.stdout,
            stderr: result.stderr,
        }
    }
}

/// Operations available on an online host. Implemented directly for local
/// execution (`LocalHost`); provider backends that talk to a remote machine
/// (SSH, Docker exec, a cloud sandbox API) implement it over their own
/// transport.
#[async_trait]
pub trait HostInterface: Send + Sync {
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> MngrResult<CommandOutcome>;

    async fn write_text_file(&self, path: &str, content: &str) -> MngrResult<()>;
    async fn read_text_file(&self, path: &str) -> MngrResult<String>;

    async fn start_tmux_session(
        &self,
        name: &str,
        command: &str,
        env: &[(String, String)],
    ) -> MngrResult<()>;

    /// True if a tmux session named `name` currently exists.
    async fn tmux_session_exists(&self, name: &str) -> MngrResult<bool>;

    async fn rename_tmux_session(&self, old_name: &str, new_name: &str) -> MngrResult<()>;
    async fn kill_tmux_session(&self, name: &str) -> MngrResult<()>;
    async fn send_keys(&self, target: &str, text: &str) -> MngrResult<()>;
    async fn capture_pane(&self, target: &str) -> MngrResult<String>;

    /// Base absolute path on the host under which per-agent state lives.
    fn host_dir(&self) -> &Path;

    /// Informational only — callers must not branch remote-only behavior off
    /// this flag per spec §4.4.
    fn is_local(&self) -> bool;
}

/// A host reachable by running commands directly on this machine.
pub struct LocalHost {
    host_dir: PathBuf,
    tmux_socket_prefix: String,
    group: ConcurrencyGroup,
}

impl LocalHost {
    pub fn new(host_dir: impl Into<PathBuf>, tmux_socket_prefix: impl Into<String>) -> Self {
        Self {
            host_dir: host_dir.into(),
            tmux_socket_prefix: tmux_socket_prefix.into(),
            group: ConcurrencyGroup::new(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> MngrResult<CommandOutcome> {
        let result = self
            .group
            .run_process_to_completion(
                "tmux",
                args,
                None,
                &[],
                Some(Duration::from_secs(10)),
                None::<fn(&str, bool)>,
            )
            .await
            .map_err(|e| MngrError::internal(format!("tmux invocation failed: {e}")))?;
        Ok(result.into())
    }
}

#[async_trait]
impl HostInterface for LocalHost {
    async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> MngrResult<CommandOutcome> {
        let env_refs: Vec<(&str, &str)> =
            env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let result = self
            .group
            .run_process_to_completion(
                "sh",
                &["-c", command],
                cwd.map(Path::new),
                &env_refs,
                timeout,
                None::<fn(&str, bool)>,
            )
            .await
            .map_err(|e| match e {
                crate::concurrency::ConcurrencyGroupError::Timeout { what, elapsed } => {
                    MngrError::Process {
                        command: command.to_string(),
                        returncode: -1,
                        stdout: String::new(),
                        stderr: format!("timed out waiting for {what} after {elapsed:?}"),
                    }
                }
                other => MngrError::internal(other.to_string()),
            })?;
        Ok(result.into())
    }

    async fn write_text_file(&self, path: &str, content: &str) -> MngrResult<()> {
        let full = self.host_dir.join(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_file_name(format!(
            "{}.tmp-{}",
            full.file_name().and_then(|n| n.to_str()).unwrap_or("file"),
            crate::primitives::random_suffix()
        ));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn read_text_file(&self, path: &str) -> MngrResult<String> {
        let full = self.host_dir.join(path);
        Ok(tokio::fs::read_to_string(&full).await?)
    }

    async fn start_tmux_session(
        &self,
        name: &str,
        command: &str,
        env: &[(String, String)],
    ) -> MngrResult<()> {
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
                "failed to start tmux session {name:?}: {}",
                result.stderr
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
            // Session step already completed by a prior partial rename attempt.
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
                "failed to rename tmux session {old_name:?} -> {new_name:?}: {}",
                result.stderr
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
                "failed to kill tmux session {name:?}: {}",
                result.stderr
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
                "failed to send keys to {target:?}: {}",
                result.stderr
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
                "failed to capture pane {target:?}: {}",
                result.stderr
            )));
        }
        Ok(result.stdout)
    }

    fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_text_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path(), "mngr-test");
        host.write_text_file("notes/a.txt", "hello").await.unwrap();
        let content = host.read_text_file("notes/a.txt").await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn execute_command_captures_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path(), "mngr-test");
        let outcome = host
            .execute_command("exit 7", None, None, &[])
            .await
            .unwrap();
        assert_eq!(outcome.returncode, 7);
        assert!(!outcome.success());
    }

    #[test]
    fn shell_quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's fine"), "'it'\\''s fine'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[tokio::test]
    async fn is_local_is_true_for_local_host() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalHost::new(dir.path(), "mngr-test");
        assert!(host.is_local());
    }
}
