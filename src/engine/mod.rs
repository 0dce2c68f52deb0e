//! Agent lifecycle engine (C7, spec §4.6): create / start / stop / destroy /
//! rename, activity tracking, and the `enforce` idle/timeout sweep.
//!
//! Grounded on `RactorLabs-ractor`'s `controller/session_manager.rs` for the
//! "iterate all owned resources, act on deadlines" shape of `enforce`, and
//! on the rename idempotency predicate decided in DESIGN.md (§9 Open
//! Question): a session named `<prefix><new>` with none named
//! `<prefix><old>` is treated as "already renamed".

pub mod activity;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{MngrError, MngrResult};
use crate::host::HostInterface;
use crate::models::{AgentRecord, AgentState, HostRef, HostState};
use crate::primitives::AgentId;
use crate::providers::ProviderBackendInterface;
use crate::store::AgentStore;

#[derive(Debug, Clone, Default)]
pub struct CreateAgentOptions {
    pub name: String,
    pub agent_type: String,
    pub command: String,
    pub work_dir: String,
    pub message: Option<String>,
    pub labels: HashMap<String, String>,
    pub start_on_boot: bool,
}

/// Per-agent serialization point (spec §5): façade calls on different agents
/// proceed independently, calls on the same agent are serialized.
#[derive(Default)]
pub struct AgentLocks {
    locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, id: &AgentId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

pub struct Engine {
    store: AgentStore,
    backend: Arc<dyn ProviderBackendInterface>,
    locks: AgentLocks,
    prefix: String,
}

impl Engine {
    pub fn new(store: AgentStore, backend: Arc<dyn ProviderBackendInterface>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            backend,
            locks: AgentLocks::new(),
            prefix: prefix.into(),
        }
    }

    fn session_name(&self, agent_name: &str) -> String {
        format!("{}{}", self.prefix, agent_name)
    }

    pub fn store(&self) -> &AgentStore {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn ProviderBackendInterface> {
        &self.backend
    }

    /// Steps 1-7 of spec §4.6. `target_host`'s connection is resolved by the
    /// caller (the façade) and passed in along with the `HostRef` to embed.
    pub async fn create(
        &self,
        host_ref: HostRef,
        host: Arc<dyn HostInterface>,
        options: CreateAgentOptions,
    ) -> MngrResult<AgentRecord> {
        let agent_name = crate::primitives::AgentName::new(options.name.clone())?;
        if self
            .store
            .resolve_by_name_or_id(agent_name.as_str())
            .await
            .is_ok()
        {
            return Err(MngrError::AgentAlreadyExists(options.name.clone()));
        }

        let id = AgentId::new_random();
        let lock = self.locks.lock_for(&id).await;
        let _guard = lock.lock().await;

        let mut record = AgentRecord {
            id: id.clone(),
            name: agent_name,
            agent_type: options.agent_type.clone(),
            command: options.command.clone(),
            work_dir: options.work_dir.clone(),
            create_time: Utc::now(),
            labels: options.labels.clone(),
            start_on_boot: options.start_on_boot,
            host_ref,
            state: AgentState::Creating,
        };
        self.store.write_agent(&record).await?;

        let session = self.session_name(record.name.as_str());
        host.start_tmux_session(&session, &record.command, &[])
            .await?;
        record.state = AgentState::Starting;
        self.store.write_agent(&record).await?;

        record.state = AgentState::Waiting;
        self.store.write_agent(&record).await?;

        if let Some(message) = options.message {
            tokio::time::sleep(Duration::from_millis(500)).await;
            host.send_keys(&session, &message).await?;
            record.state = AgentState::Running;
            self.store.write_agent(&record).await?;
        }

        Ok(record)
    }

    pub async fn start(&self, id: &AgentId, host: Arc<dyn HostInterface>, resume_message: Option<String>) -> MngrResult<()> {
        let lock = self.locks.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.store.read_agent(id).await?;
        if record.state == AgentState::Destroyed {
            return Err(MngrError::State(format!(
                "cannot start agent {id}: already destroyed"
            )));
        }

        let session = self.session_name(record.name.as_str());
        if !host.tmux_session_exists(&session).await? {
            host.start_tmux_session(&session, &record.command, &[]).await?;
        }
        record.state = AgentState::Running;
        self.store.write_agent(&record).await?;

        if let Some(message) = resume_message {
            tokio::time::sleep(Duration::from_millis(500)).await;
            host.send_keys(&session, &message).await?;
        }
        Ok(())
    }

    pub async fn stop(&self, id: &AgentId, host: Arc<dyn HostInterface>, timeout: Duration) -> MngrResult<()> {
        let lock = self.locks.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.store.read_agent(id).await?;
        let session = self.session_name(record.name.as_str());

        if host.tmux_session_exists(&session).await? {
            host.send_keys(&session, "C-c").await.ok();
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if !host.tmux_session_exists(&session).await? {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            host.kill_tmux_session(&session).await?;
        }

        record.state = AgentState::Stopped;
        self.store.write_agent(&record).await?;
        Ok(())
    }

    pub async fn destroy(
        &self,
        id: &AgentId,
        host: Arc<dyn HostInterface>,
        deregister_backend: impl Fn(&AgentId) -> futures::future::BoxFuture<'static, MngrResult<()>>,
    ) -> MngrResult<()> {
        let lock = self.locks.lock_for(id).await;
        let _guard = lock.lock().await;

        self.stop(id, host, Duration::from_secs(10)).await.ok();
        self.store.delete_agent(id).await?;
        deregister_backend(id).await?;
        Ok(())
    }

    /// `(a)` rewrite `data.json`, `(b)` rename the tmux session. Idempotent:
    /// if a session named `<prefix><new>` already exists and none named
    /// `<prefix><old>` does, step (b) is treated as already done.
    pub async fn rename(&self, id: &AgentId, new_name: &str, host: Arc<dyn HostInterface>) -> MngrResult<()> {
        let lock = self.locks.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut record = self.store.read_agent(id).await?;
        let old_session = self.session_name(record.name.as_str());
        let new_agent_name = crate::primitives::AgentName::new(new_name)?;
        let new_session = self.session_name(new_agent_name.as_str());

        if record.name.as_str() != new_name {
            record.name = new_agent_name;
            self.store.write_agent(&record).await?;
        }

        host.rename_tmux_session(&old_session, &new_session).await?;
        Ok(())
    }

    /// Background sweep (spec §4.6 Enforcement). Reads every host owned by
    /// the backend and checks idle age / transition-timeout deadlines.
    /// Local hosts are skipped for idle enforcement. When `dry_run` is true,
    /// no mutating calls are made; actions are only reported.
    pub async fn enforce(&self, cg: &crate::concurrency::ConcurrencyGroup, params: EnforceParams) -> MngrResult<EnforceReport> {
        let mut report = EnforceReport::default();
        let hosts = self.backend.list_hosts(cg, false).await?;

        for host_record in hosts {
            if host_record.provider_name.as_str() == "local" {
                continue;
            }

            if params.check_idle {
                let agents = self.store.list_agents().await.unwrap_or_default();
                let relevant = agents
                    .iter()
                    .filter(|a| a.host_ref.host_id == host_record.id);
                let mut newest_activity = None;
                for agent in relevant {
                    let path = self.store.activity_ssh_path(&agent.id);
                    if let Some(ts) = activity::last_activity_mtime(&path).await {
                        newest_activity = Some(match newest_activity {
                            Some(prev) if prev > ts => prev,
                            _ => ts,
                        });
                    }
                }

                if let Some(last_activity) = newest_activity {
                    let age = Utc::now().signed_duration_since(last_activity);
                    if age.num_seconds() as u64 > params.idle_timeout.as_secs() {
                        report.idle_violations.push(host_record.id.clone());
                        if self.backend.supports_shutdown_hosts() {
                            report.actions.push(EnforceAction::StopHost(host_record.id.clone()));
                            if !params.dry_run {
                                self.backend.stop_host(&host_record.id).await.ok();
                            }
                        }
                    }
                }
            }

            if params.check_timeouts {
                if let Some(state_timeout) = params.timeout_for(host_record.state) {
                    let age = Utc::now().signed_duration_since(host_record.state_since);
                    if age.num_seconds() as u64 > state_timeout.as_secs() {
                        report.timeout_violations.push(host_record.id.clone());
                        if self.backend.supports_shutdown_hosts() {
                            report.actions.push(EnforceAction::DestroyHost(host_record.id.clone()));
                            if !params.dry_run {
                                self.backend.destroy_host(&host_record.id).await.ok();
                            }
                        }
                    }
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnforceParams {
    pub check_idle: bool,
    pub check_timeouts: bool,
    pub idle_timeout: Duration,
    /// Max time a host may spend in `BUILDING` before it is flagged.
    pub building_timeout: Duration,
    /// Max time a host may spend in `STARTING` before it is flagged.
    pub starting_timeout: Duration,
    /// Max time a host may spend in `STOPPING` before it is flagged.
    pub stopping_timeout: Duration,
    pub dry_run: bool,
}

impl EnforceParams {
    /// The configured timeout for `state`, or `None` for states that don't
    /// represent an in-progress transition.
    fn timeout_for(&self, state: HostState) -> Option<Duration> {
        match state {
            HostState::Building => Some(self.building_timeout),
            HostState::Starting => Some(self.starting_timeout),
            HostState::Stopping => Some(self.stopping_timeout),
            HostState::Running | HostState::Stopped | HostState::Destroyed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EnforceAction {
    StopHost(crate::primitives::HostId),
    DestroyHost(crate::primitives::HostId),
}

#[derive(Debug, Clone, Default)]
pub struct EnforceReport {
    pub idle_violations: Vec<crate::primitives::HostId>,
    pub timeout_violations: Vec<crate::primitives::HostId>,
    pub actions: Vec<EnforceAction>,
}
