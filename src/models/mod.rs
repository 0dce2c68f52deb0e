//! Persisted record types (C3 data model, spec §3).
//!
//! `AgentRecord`/`HostRecord` mirror `RactorLabs-ractor`'s `shared/models::{Agent,
//! SandboxInstance}` in spirit (plain serde structs with explicit state
//! enums) but are filesystem-JSON documents, not `sqlx` rows, per the data
//! model's atomic-file-replacement invariant.

pub mod thread;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::primitives::{AgentId, AgentName, HostId, HostName, ProviderInstanceName};

/// `AgentState` ∈ {CREATING, STARTING, WAITING, RUNNING, STOPPING, STOPPED,
/// DESTROYED}, matching the `UpperCaseStrEnum` serde rename idiom used below
/// for `OneTimeCodeStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentState {
    Creating,
    Starting,
    Waiting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Destroyed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Destroyed,
}

/// A reference to the host an agent runs on, embedded in `AgentRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRef {
    pub host_id: HostId,
    pub host_name: HostName,
    pub provider_name: ProviderInstanceName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub name: AgentName,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub command: String,
    pub work_dir: String,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub start_on_boot: bool,
    pub host_ref: HostRef,
    pub state: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub name: HostName,
    pub provider_name: ProviderInstanceName,
    pub state: HostState,
    /// When `state` was last set; used by `Engine::enforce` to detect a
    /// BUILDING/STARTING/STOPPING transition stuck past its timeout.
    #[serde(default = "Utc::now")]
    pub state_since: DateTime<Utc>,
    #[serde(default)]
    pub snapshots: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub plugin_data: HashMap<String, serde_json::Value>,
}

/// `{AgentId → backend URL}` table the proxy consults to route requests.
/// Persisted as a single JSON document, not one file per agent, since it is
/// small and read on every proxied request (spec §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendEntry {
    pub agent_id: AgentId,
    pub url: String,
}
