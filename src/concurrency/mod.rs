//! Concurrency group (C2): a scoped owner of subprocesses and background
//! tasks with a composable shutdown event.
//!
//! Grounded in `RactorLabs-ractor`'s async/tokio idiom (its
//! binaries are all `#[tokio::main]`, and `controller/session_manager.rs`'s
//! polling loop shows the "check an elapsed timer, sleep a short step"
//! pattern reused below for `ShutdownEvent::wait`). The Python original
//! (`libs/concurrency_group`) modeled this with `threading.Event` composition;
//! here it is `tokio::sync::Notify` plus an `AtomicBool` latch.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::timeout as tokio_timeout;

#[derive(Debug, Error)]
pub enum ConcurrencyGroupError {
    #[error("failed to spawn process {command:?}: {source}")]
    ProcessSetup {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for {what} after {elapsed:?}")]
    Timeout { what: String, elapsed: Duration },
    #[error("concurrency group teardown error: {0}")]
    Teardown(String),
}

/// An event that is set when any of {itself, an external event, a parent
/// event} is set. Mirrors the Python `CompoundEvent`.
#[derive(Clone)]
pub struct ShutdownEvent {
    own: Arc<AtomicBool>,
    notify: Arc<Notify>,
    parents: Vec<ShutdownEvent>,
}

impl ShutdownEvent {
    pub fn new() -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            parents: Vec::new(),
        }
    }

    /// A child event that is also set whenever `self` (or any of its
    /// ancestors) is set, composing transitively.
    pub fn child(&self) -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            parents: vec![self.clone()],
        }
    }

    pub fn set(&self) {
        self.own.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.own.load(Ordering::SeqCst) || self.parents.iter().any(ShutdownEvent::is_set)
    }

    /// Wait until set, or until `timeout` elapses (if given). Returns
    /// whether the event ended up set.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        if self.is_set() {
            return true;
        }
        let poll_step = Duration::from_millis(50);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let wait_for = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() {
                        return self.is_set();
                    }
                    remaining.min(poll_step)
                }
                None => poll_step,
            };
            let _ = tokio_timeout(wait_for, self.notify.notified()).await;
            if self.is_set() {
                return true;
            }
            if let Some(d) = deadline {
                if tokio::time::Instant::now() >= d {
                    return self.is_set();
                }
            }
        }
    }
}

impl Default for ShutdownEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ProcessResult {
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// A scoped owner of concurrent work: subprocesses and background tasks it
/// spawns are torn down when the group is dropped or explicitly shut down.
pub struct ConcurrencyGroup {
    shutdown: ShutdownEvent,
    tasks: JoinSet<()>,
}

impl ConcurrencyGroup {
    pub fn new() -> Self {
        Self {
            shutdown: ShutdownEvent::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn with_parent(parent: &ShutdownEvent) -> Self {
        Self {
            shutdown: parent.child(),
            tasks: JoinSet::new(),
        }
    }

    pub fn shutdown_event(&self) -> ShutdownEvent {
        self.shutdown.clone()
    }

    pub fn child(&self) -> Self {
        Self::with_parent(&self.shutdown)
    }

    /// Run a command to completion, optionally streaming each output line as
    /// it is produced while still returning the fully accumulated output.
    pub async fn run_process_to_completion(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&std::path::Path>,
        env: &[(&str, &str)],
        timeout: Option<Duration>,
        mut on_output: Option<impl FnMut(&str, bool) + Send>,
    ) -> Result<ProcessResult, ConcurrencyGroupError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| ConcurrencyGroupError::ProcessSetup {
            command: command.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        let mut out = String::new();
        let mut err = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;

        let run = async {
            loop {
                if stdout_done && stderr_done {
                    break;
                }
                tokio::select! {
                    line = stdout_lines.next_line(), if !stdout_done => {
                        match line {
                            Ok(Some(l)) => {
                                if let Some(cb) = on_output.as_mut() { cb(&l, true); }
                                out.push_str(&l);
                                out.push('\n');
                            }
                            _ => stdout_done = true,
                        }
                    }
                    line = stderr_lines.next_line(), if !stderr_done => {
                        match line {
                            Ok(Some(l)) => {
                                if let Some(cb) = on_output.as_mut() { cb(&l, false); }
                                err.push_str(&l);
                                err.push('\n');
                            }
                            _ => stderr_done = true,
                        }
                    }
                }
            }
        };

        if let Some(t) = timeout {
            if tokio_timeout(t, run).await.is_err() {
                let _ = child.start_kill();
                return Err(ConcurrencyGroupError::Timeout {
                    what: format!("process {command:?}"),
                    elapsed: t,
                });
            }
        } else {
            run.await;
        }

        let status = child.wait().await.map_err(|source| ConcurrencyGroupError::ProcessSetup {
            command: command.to_string(),
            source,
        })?;

        Ok(ProcessResult {
            returncode: status.code().unwrap_or(-1),
            stdout: out,
            stderr: err,
        })
    }

    /// Spawn a background task owned by this group; it observes
    /// `shutdown_event().is_set()` cooperatively and is aborted on drop.
    pub fn spawn_background<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }

    /// Run a command in the background, returning a handle that can be
    /// polled, waited on, or drained for lazily streamed output lines.
    pub fn run_process_in_background(
        &self,
        command: &str,
        args: &[&str],
        cwd: Option<&std::path::Path>,
    ) -> Result<BackgroundProcess, ConcurrencyGroupError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let mut child = cmd.spawn().map_err(|source| ConcurrencyGroupError::ProcessSetup {
            command: command.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let (tx, rx) = mpsc::unbounded_channel();

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx_out.send((line, true)).is_err() {
                    break;
                }
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send((line, false)).is_err() {
                    break;
                }
            }
        });

        Ok(BackgroundProcess {
            child,
            output_rx: rx,
        })
    }

    /// Signal all spawned tasks to stop, give them a grace period, then abort
    /// whatever remains.
    pub async fn shutdown(mut self, grace_period: Duration) {
        self.shutdown.set();
        let _ = tokio_timeout(grace_period, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        self.tasks.abort_all();
    }
}

impl Default for ConcurrencyGroup {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BackgroundProcess {
    child: tokio::process::Child,
    output_rx: mpsc::UnboundedReceiver<(String, bool)>,
}

impl BackgroundProcess {
    /// Pull the next `(line, is_stdout)` pair, or `None` once both streams
    /// have ended (the end-of-stream marker).
    pub async fn next_output_line(&mut self) -> Option<(String, bool)> {
        self.output_rx.recv().await
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    pub fn poll(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_event_child_observes_parent() {
        let parent = ShutdownEvent::new();
        let child = parent.child();
        assert!(!child.is_set());
        parent.set();
        assert!(child.is_set());
    }

    #[tokio::test]
    async fn wait_returns_immediately_once_set() {
        let event = ShutdownEvent::new();
        event.set();
        let was_set = event.wait(Some(Duration::from_millis(10))).await;
        assert!(was_set);
    }

    #[tokio::test]
    async fn wait_times_out_when_never_set() {
        let event = ShutdownEvent::new();
        let was_set = event.wait(Some(Duration::from_millis(30))).await;
        assert!(!was_set);
    }

    #[tokio::test]
    async fn run_process_to_completion_captures_output() {
        let group = ConcurrencyGroup::new();
        let result = group
            .run_process_to_completion(
                "sh",
                &["-c", "echo hi; echo err 1>&2"],
                None,
                &[],
                Some(Duration::from_secs(5)),
                None::<fn(&str, bool)>,
            )
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hi");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn run_process_to_completion_times_out() {
        let group = ConcurrencyGroup::new();
        let result = group
            .run_process_to_completion(
                "sleep",
                &["5"],
                None,
                &[],
                Some(Duration::from_millis(50)),
                None::<fn(&str, bool)>,
            )
            .await;
        assert!(matches!(result, Err(ConcurrencyGroupError::Timeout { .. })));
    }
}
