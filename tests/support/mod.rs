//! Test doubles shared by the integration suites. Exercising `Engine`
//! against a real multiplexer would make these tests depend on `tmux` being
//! installed on the machine that runs them; `MockHost` and `MockBackend`
//! stand in for a real host/provider the way `RactorLabs-ractor`'s own test
//! suite swaps a real sandbox connector for an in-memory one.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mngr::concurrency::ConcurrencyGroup;
use mngr::error::{MngrError, MngrResult};
use mngr::host::{CommandOutcome, HostInterface};
use mngr::models::HostRecord;
use mngr::primitives::{HostId, HostName, ProviderBackendName};
use mngr::providers::{HostCreateOptions, HostResources, ProviderBackendInterface};

/// An in-memory stand-in for a multiplexer-backed host: tracks session
/// names instead of spawning a real `tmux` process.
pub struct MockHost {
    host_dir: PathBuf,
    sessions: Mutex<HashSet<String>>,
}

impl MockHost {
    pub fn new(host_dir: impl Into<PathBuf>) -> Self {
        Self {
            host_dir: host_dir.into(),
            sessions: Mutex::new(HashSet::new()),
        }
    }

    pub async fn create_session(&self, name: &str) {
        self.sessions.lock().unwrap().insert(name.to_string());
    }

    pub async fn session_exists(&self, name: &str) -> bool {
        self.sessions.lock().unwrap().contains(name)
    }
}

#[async_trait]
impl HostInterface for MockHost {
    async fn execute_command(
        &self,
        _command: &str,
        _timeout: Option<Duration>,
        _cwd: Option<&str>,
        _env: &[(String, String)],
    ) -> MngrResult<CommandOutcome> {
        Ok(CommandOutcome {
            returncode: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn write_text_file(&self, _path: &str, _content: &str) -> MngrResult<()> {
        Ok(())
    }

    async fn read_text_file(&self, _path: &str) -> MngrResult<String> {
        Ok(String::new())
    }

    async fn start_tmux_session(&self, name: &str, _command: &str, _env: &[(String, String)]) -> MngrResult<()> {
        self.sessions.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn tmux_session_exists(&self, name: &str) -> MngrResult<bool> {
        Ok(self.sessions.lock().unwrap().contains(name))
    }

    async fn rename_tmux_session(&self, old_name: &str, new_name: &str) -> MngrResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains(new_name) && !sessions.contains(old_name) {
            return Ok(());
        }
        if !sessions.remove(old_name) {
            return Err(MngrError::internal(format!("no such session {old_name:?}")));
        }
        sessions.insert(new_name.to_string());
        Ok(())
    }

    async fn kill_tmux_session(&self, name: &str) -> MngrResult<()> {
        self.sessions.lock().unwrap().remove(name);
        Ok(())
    }

    async fn send_keys(&self, _target: &str, _text: &str) -> MngrResult<()> {
        Ok(())
    }

    async fn capture_pane(&self, _target: &str) -> MngrResult<String> {
        Ok(String::new())
    }

    fn host_dir(&self) -> &Path {
        &self.host_dir
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// A provider backend with no hosts of its own; enough to satisfy
/// [`Engine::new`]'s constructor when a test only exercises agent-level
/// operations against a directly-supplied [`MockHost`].
pub struct NoopBackend;

#[async_trait]
impl ProviderBackendInterface for NoopBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::Local
    }

    async fn list_hosts(&self, _cg: &ConcurrencyGroup, _include_destroyed: bool) -> MngrResult<Vec<HostRecord>> {
        Ok(Vec::new())
    }

    async fn get_host(&self, identifier: &str) -> MngrResult<HostRecord> {
        Err(MngrError::HostNotFound(identifier.to_string()))
    }

    async fn create_host(&self, _name: &HostName, _options: HostCreateOptions) -> MngrResult<HostRecord> {
        Err(MngrError::UserInput("NoopBackend cannot create hosts".to_string()))
    }

    async fn stop_host(&self, _id: &HostId) -> MngrResult<()> {
        Ok(())
    }

    async fn start_host(&self, _id: &HostId) -> MngrResult<()> {
        Ok(())
    }

    async fn destroy_host(&self, _id: &HostId) -> MngrResult<()> {
        Ok(())
    }

    async fn rename_host(&self, _id: &HostId, _new_name: &HostName) -> MngrResult<()> {
        Ok(())
    }

    async fn get_host_resources(&self, _id: &HostId) -> MngrResult<HostResources> {
        Ok(HostResources {
            cpu_count: None,
            memory_bytes: None,
            disk_bytes: None,
        })
    }

    async fn get_host_tags(&self, _id: &HostId) -> MngrResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn add_tags_to_host(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn remove_tags_from_host(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn set_host_tags(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn on_connection_error(&self, _id: &HostId) {}

    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        Err(MngrError::HostNotFound(id.to_string()))
    }

    fn supports_shutdown_hosts(&self) -> bool {
        true
    }
}

pub fn noop_backend() -> Arc<dyn ProviderBackendInterface> {
    Arc::new(NoopBackend)
}

/// A backend with one fixed non-local host, for testing `Engine::enforce`'s
/// idle sweep without a real provider.
pub struct SingleHostBackend {
    host: HostRecord,
    stopped: Mutex<Vec<HostId>>,
}

impl SingleHostBackend {
    pub fn new(host: HostRecord) -> Self {
        Self {
            host,
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn stopped_hosts(&self) -> Vec<HostId> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderBackendInterface for SingleHostBackend {
    fn backend_name(&self) -> ProviderBackendName {
        ProviderBackendName::Docker
    }

    async fn list_hosts(&self, _cg: &ConcurrencyGroup, _include_destroyed: bool) -> MngrResult<Vec<HostRecord>> {
        Ok(vec![self.host.clone()])
    }

    async fn get_host(&self, _identifier: &str) -> MngrResult<HostRecord> {
        Ok(self.host.clone())
    }

    async fn create_host(&self, _name: &HostName, _options: HostCreateOptions) -> MngrResult<HostRecord> {
        Ok(self.host.clone())
    }

    async fn stop_host(&self, id: &HostId) -> MngrResult<()> {
        self.stopped.lock().unwrap().push(id.clone());
        Ok(())
    }

    async fn start_host(&self, _id: &HostId) -> MngrResult<()> {
        Ok(())
    }

    async fn destroy_host(&self, _id: &HostId) -> MngrResult<()> {
        Ok(())
    }

    async fn rename_host(&self, _id: &HostId, _new_name: &HostName) -> MngrResult<()> {
        Ok(())
    }

    async fn get_host_resources(&self, _id: &HostId) -> MngrResult<HostResources> {
        Ok(HostResources {
            cpu_count: None,
            memory_bytes: None,
            disk_bytes: None,
        })
    }

    async fn get_host_tags(&self, _id: &HostId) -> MngrResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn add_tags_to_host(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn remove_tags_from_host(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn set_host_tags(&self, _id: &HostId, _tags: &[String]) -> MngrResult<()> {
        Ok(())
    }

    async fn on_connection_error(&self, _id: &HostId) {}

    async fn connect(&self, id: &HostId) -> MngrResult<Arc<dyn HostInterface>> {
        Err(MngrError::HostNotFound(id.to_string()))
    }

    fn supports_shutdown_hosts(&self) -> bool {
        true
    }
}
