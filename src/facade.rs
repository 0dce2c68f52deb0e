//! Engine façade (C11, spec §4.10): the library surface every front-end
//! (CLI, HTTP API, TUI — none shipped by this crate) calls into.
//!
//! Result types are grounded on
//! `original_source/libs/mng/imbue/mng/api/data_types.py`'s frozen pydantic
//! models, translated to `#[derive(Serialize)]` plain structs since this
//! crate has no front-end to hand typed Python objects to — only a stable
//! wire shape.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::auth::FileAuthStore;
use crate::backend_resolver::BackendResolver;
use crate::concurrency::ConcurrencyGroup;
use crate::config::MngrConfig;
use crate::engine::{CreateAgentOptions, Engine, EnforceParams, EnforceReport};
use crate::error::{MngrError, MngrResult};
use crate::host::HostInterface;
use crate::models::{AgentRecord, HostRecord, HostRef};
use crate::primitives::{AgentId, HostId, HostName, OneTimeCode};
use crate::providers::{HostCreateOptions, ProviderBackendInterface};
use crate::store::AgentStore;

/// One configured provider instance: its backend plus the agent-lifecycle
/// engine rooted at that provider's host directory.
struct ProviderEntry {
    backend: Arc<dyn ProviderBackendInterface>,
    engine: Arc<Engine>,
}

pub struct Facade {
    config: MngrConfig,
    providers: HashMap<String, ProviderEntry>,
    auth_store: FileAuthStore,
    resolver: BackendResolver,
}

impl Facade {
    /// Builds one [`Engine`] per `[providers.*]` config entry, each rooted at
    /// `<host_dir>/providers/<name>` (spec §6's `profiles/<id>/providers/<name>/...`
    /// layout, simplified to a single implicit profile since this crate does
    /// not implement multi-profile switching).
    pub fn from_config(config: MngrConfig, host_dir: impl Into<PathBuf>) -> MngrResult<Self> {
        let host_dir = host_dir.into();
        crate::providers::register_builtin_backends();

        let mut providers = HashMap::new();
        for (name, entry) in &config.providers {
            let backend = crate::providers::build_provider_instance(entry.backend).ok_or_else(|| {
                MngrError::Config(format!("no registered backend for provider instance {name:?}"))
            })?;
            let store = AgentStore::new(host_dir.join("providers").join(name));
            let engine = Arc::new(Engine::new(store, backend.clone(), config.prefix.clone()));
            providers.insert(name.clone(), ProviderEntry { backend, engine });
        }

        Ok(Self {
            config,
            providers,
            auth_store: FileAuthStore::new(host_dir.join("auth")),
            resolver: BackendResolver::new(host_dir),
        })
    }

    fn provider(&self, name: &str) -> MngrResult<&ProviderEntry> {
        self.providers
            .get(name)
            .ok_or_else(|| MngrError::UserInput(format!("unknown provider instance {name:?}")))
    }

    fn enabled_provider_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    // ---- list -----------------------------------------------------------

    pub async fn list(&self, provider_filter: Option<&str>) -> ListResult {
        let mut agents = Vec::new();
        let mut errors = Vec::new();

        let names = match provider_filter {
            Some(name) => vec![name.to_string()],
            None => self.enabled_provider_names(),
        };

        for name in names {
            let Some(entry) = self.providers.get(&name) else {
                errors.push(format!("unknown provider instance {name:?}"));
                continue;
            };
            match entry.engine.store().list_agents().await {
                Ok(records) => agents.extend(records.into_iter().map(|r| AgentInfo::from_record(&name, r))),
                Err(e) => errors.push(format!("{name}: {e}")),
            }
        }

        agents.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        ListResult { agents, errors }
    }

    // ---- create -----------------------------------------------------------

    pub async fn create(
        &self,
        provider_name: &str,
        host_name: &HostName,
        options: CreateAgentOptions,
        connection: ConnectionOptions,
    ) -> MngrResult<CreateAgentResult> {
        let entry = self.provider(provider_name)?;
        let cg = ConcurrencyGroup::new();
        let existing = entry.backend.list_hosts(&cg, false).await?;
        let host_record = match existing.into_iter().find(|h| h.name == *host_name) {
            Some(h) => h,
            None => {
                entry
                    .backend
                    .create_host(host_name, HostCreateOptions::default())
                    .await?
            }
        };
        let host = entry.backend.connect(&host_record.id).await?;
        let host_ref = HostRef {
            host_id: host_record.id.clone(),
            host_name: host_record.name.clone(),
            provider_name: host_record.provider_name.clone(),
        };

        let mut options = options;
        if options.message.is_none() {
            options.message = connection.message.clone();
        }

        let agent = entry.engine.create(host_ref, host, options).await?;
        if connection.is_wait {
            // handled by the caller via `open`, not here; façade `create` never blocks.
        }

        Ok(CreateAgentResult {
            agent,
            host: host_record,
        })
    }

    // ---- lifecycle ---------------------------------------------------------

    pub async fn start(&self, provider_name: &str, agent_id: &AgentId, resume_message: Option<String>) -> MngrResult<LifecycleResult> {
        let entry = self.provider(provider_name)?;
        let before = entry.engine.store().read_agent(agent_id).await?;
        let host = entry.backend.connect(&before.host_ref.host_id).await?;
        entry.engine.start(agent_id, host, resume_message).await?;
        let after = entry.engine.store().read_agent(agent_id).await?;
        Ok(LifecycleResult { before, after })
    }

    pub async fn stop(&self, provider_name: &str, agent_id: &AgentId, timeout: Duration) -> MngrResult<LifecycleResult> {
        let entry = self.provider(provider_name)?;
        let before = entry.engine.store().read_agent(agent_id).await?;
        let host = entry.backend.connect(&before.host_ref.host_id).await?;
        entry.engine.stop(agent_id, host, timeout).await?;
        let after = entry.engine.store().read_agent(agent_id).await?;
        Ok(LifecycleResult { before, after })
    }

    pub async fn destroy(&self, provider_name: &str, agent_id: &AgentId) -> MngrResult<AgentRecord> {
        let entry = self.provider(provider_name)?;
        let before = entry.engine.store().read_agent(agent_id).await?;
        let host = entry.backend.connect(&before.host_ref.host_id).await?;
        let resolver_data_dir = self.resolver.data_dir().to_path_buf();
        entry
            .engine
            .destroy(
                agent_id,
                host,
                move |id| {
                    let resolver = BackendResolver::new(resolver_data_dir.clone());
                    let id = id.clone();
                    Box::pin(async move { resolver.deregister_backend(&id).await })
                },
            )
            .await?;
        Ok(before)
    }

    pub async fn rename(&self, provider_name: &str, agent_id: &AgentId, new_name: &str) -> MngrResult<LifecycleResult> {
        let entry = self.provider(provider_name)?;
        let before = entry.engine.store().read_agent(agent_id).await?;
        let host = entry.backend.connect(&before.host_ref.host_id).await?;
        entry.engine.rename(agent_id, new_name, host).await?;
        let after = entry.engine.store().read_agent(agent_id).await?;
        Ok(LifecycleResult { before, after })
    }

    // ---- message / exec -----------------------------------------------------

    pub async fn message(&self, provider_name: &str, agent_ids: &[AgentId], content: &str, on_error: OnErrorPolicy) -> MngrResult<MessageResult> {
        let entry = self.provider(provider_name)?;
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for id in agent_ids {
            let outcome = async {
                let record = entry.engine.store().read_agent(id).await?;
                let host = entry.backend.connect(&record.host_ref.host_id).await?;
                let session = format!("{}{}", self.config.prefix, record.name.as_str());
                host.send_keys(&session, content).await
            }
            .await;

            match outcome {
                Ok(()) => successful.push(id.clone()),
                Err(e) => {
                    failed.push((id.clone(), e.to_string()));
                    if matches!(on_error, OnErrorPolicy::Abort) {
                        break;
                    }
                }
            }
        }

        Ok(MessageResult { successful, failed })
    }

    pub async fn exec(
        &self,
        provider_name: &str,
        agent_id: &AgentId,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> MngrResult<ExecResult> {
        let entry = self.provider(provider_name)?;
        let record = entry.engine.store().read_agent(agent_id).await?;
        let host = entry.backend.connect(&record.host_ref.host_id).await?;
        let outcome = host.execute_command(command, timeout, cwd, &[]).await?;
        Ok(ExecResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            success: outcome.success(),
        })
    }

    // ---- transcript / open / pair --------------------------------------------

    pub async fn transcript(&self, provider_name: &str, agent_id: &AgentId) -> MngrResult<TranscriptResult> {
        let entry = self.provider(provider_name)?;
        let record = entry.engine.store().read_agent(agent_id).await?;
        let path = entry
            .engine
            .store()
            .host_dir()
            .join("agents")
            .join(record.id.as_str())
            .join("logs")
            .join("transcript.jsonl");
        let notifications = crate::models::thread::read_all(&path).await?;
        let content = notifications
            .iter()
            .filter_map(|n| match n {
                crate::models::thread::Notification::Message(m) => Some(m.content.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(TranscriptResult {
            content,
            session_file_path: path,
        })
    }

    /// Returns the URL an operator should open to reach `agent_id` through
    /// the proxy. `is_wait`/`is_active` describe caller-side behavior (block
    /// until interrupted; record activity while waiting) that belongs to the
    /// CLI front-end this crate does not ship, so they are accepted but not
    /// acted on here.
    pub async fn open(&self, provider_name: &str, agent_id: &AgentId, _is_wait: bool, _is_active: bool) -> MngrResult<String> {
        let entry = self.provider(provider_name)?;
        entry.engine.store().read_agent(agent_id).await?;
        let code = OneTimeCode::generate();
        self.auth_store.add_one_time_code(agent_id, code.clone()).await?;
        Ok(format!("/login?agent_id={agent_id}&one_time_code={code}"))
    }

    /// Thin wrapper over `open(is_wait=true, is_active=true)` (spec.md's
    /// distillation dropped this convenience alias; kept here since it adds
    /// no new semantics beyond fixing those two flags).
    pub async fn pair(&self, provider_name: &str, agent_id: &AgentId) -> MngrResult<String> {
        self.open(provider_name, agent_id, true, true).await
    }

    // ---- enforce --------------------------------------------------------------

    pub async fn enforce(&self, provider_filter: Option<&str>, params: EnforceParams) -> EnforceResult {
        let mut actions = Vec::new();
        let mut idle_violations = Vec::new();
        let mut timeout_violations = Vec::new();
        let mut hosts_checked = 0usize;
        let mut errors = Vec::new();

        let names = match provider_filter {
            Some(name) => vec![name.to_string()],
            None => self.enabled_provider_names(),
        };

        for name in names {
            let Some(entry) = self.providers.get(&name) else {
                errors.push(format!("unknown provider instance {name:?}"));
                continue;
            };
            let cg = ConcurrencyGroup::new();
            match entry.engine.enforce(&cg, params.clone()).await {
                Ok(EnforceReport { idle_violations: v, timeout_violations: t, actions: a }) => {
                    hosts_checked += entry.backend.list_hosts(&cg, false).await.map(|h| h.len()).unwrap_or(0);
                    idle_violations.extend(v);
                    timeout_violations.extend(t);
                    actions.extend(a.into_iter().map(|action| format!("{name}: {action:?}")));
                }
                Err(e) => errors.push(format!("{name}: {e}")),
            }
        }

        EnforceResult {
            actions,
            hosts_checked,
            idle_violations,
            timeout_violations,
            errors,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OnErrorPolicy {
    Abort,
    Continue,
    RetryUntil,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: AgentId,
    pub name: String,
    pub provider: String,
    pub host_id: HostId,
    pub state: String,
}

impl AgentInfo {
    fn from_record(provider: &str, record: AgentRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.to_string(),
            provider: provider.to_string(),
            host_id: record.host_ref.host_id,
            state: format!("{:?}", record.state).to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub agents: Vec<AgentInfo>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateAgentResult {
    pub agent: AgentRecord,
    pub host: HostRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleResult {
    pub before: AgentRecord,
    pub after: AgentRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResult {
    pub successful: Vec<AgentId>,
    pub failed: Vec<(AgentId, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptResult {
    pub content: String,
    pub session_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnforceResult {
    pub actions: Vec<String>,
    pub hosts_checked: usize,
    pub idle_violations: Vec<HostId>,
    pub timeout_violations: Vec<HostId>,
    pub errors: Vec<String>,
}

/// Specifies where to source a new agent's working directory from:
/// a local path, an existing agent, or both (supplemented feature, grounded
/// on `data_types.py`'s `SourceLocation`).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceLocation {
    pub path: Option<PathBuf>,
    pub agent_id: Option<AgentId>,
    pub agent_name: Option<String>,
    pub host_id: Option<HostId>,
    pub host_name: Option<HostName>,
}

impl SourceLocation {
    pub fn is_from_agent(&self) -> bool {
        self.agent_id.is_some() || self.agent_name.is_some()
    }
}

/// Options controlling what `open`/`pair` do after issuing a URL
/// (supplemented feature, grounded on `data_types.py`'s `ConnectionOptions`).
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionOptions {
    pub is_reconnect: bool,
    pub is_interactive: Option<bool>,
    pub message: Option<String>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub attach_command: Option<String>,
    pub is_unknown_host_allowed: bool,
    /// Not part of `data_types.py`; this crate's `create` needs to know
    /// whether the caller intends to immediately `open`/`pair` so it can
    /// skip its own blocking wait (the façade never blocks by itself).
    pub is_wait: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            is_reconnect: true,
            is_interactive: None,
            message: None,
            retry_count: 3,
            retry_delay: Duration::from_secs(5),
            attach_command: None,
            is_unknown_host_allowed: false,
            is_wait: false,
        }
    }
}

/// Which idle-resource classes a garbage-collection sweep should target
/// (supplemented feature, grounded on `data_types.py`'s `GcResourceTypes`).
/// No façade function in this crate currently performs the sweep described
/// by [`GcResult`]; the types are carried so an external front-end can shape
/// a request against a future `gc` entry point without this crate needing to
/// invent one prematurely.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcResourceTypes {
    pub is_machines: bool,
    pub is_snapshots: bool,
    pub is_volumes: bool,
    pub is_work_dirs: bool,
    pub is_logs: bool,
    pub is_build_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcResult {
    pub machines_destroyed: Vec<HostId>,
    pub snapshots_destroyed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub destroyed_agents: Vec<String>,
    pub stopped_agents: Vec<String>,
    pub errors: Vec<String>,
}
