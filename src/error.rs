//! Flat error taxonomy shared by the store, engine and façade (C12 / spec §7).
//!
//! Grounded in `RactorLabs-ractor/src/api/rest/error.rs`'s `ApiError` enum;
//! generalized here beyond HTTP responses since the façade is consumed by
//! non-HTTP front-ends too. Only `mngr::proxy` adds an `IntoResponse` impl,
//! and it never leaks these variants' detail to the browser.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MngrError {
    #[error("{0}")]
    UserInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider error ({host:?}): {message}")]
    Provider {
        host: Option<String>,
        message: String,
        /// When true the façade should abort the whole call; when false it
        /// should record the error and continue with other providers/hosts.
        is_fatal: bool,
    },

    #[error("command {command:?} exited with status {returncode}: {stderr}")]
    Process {
        command: String,
        returncode: i32,
        stdout: String,
        stderr: String,
    },

    #[error("host is offline: {0}")]
    HostOffline(String),

    #[error("invalid state transition: {0}")]
    State(String),

    #[error("agent already exists: {0}")]
    AgentAlreadyExists(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MngrError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
        }
    }

    pub fn provider_fatal(host: Option<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            host,
            message: message.into(),
            is_fatal: true,
        }
    }

    pub fn provider_degraded(host: Option<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            host,
            message: message.into(),
            is_fatal: false,
        }
    }

    /// Process exit code a CLI front-end should use; 0 only for non-errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            MngrError::UserInput(_) | MngrError::Config(_) => 1,
            _ => 1,
        }
    }
}

pub type MngrResult<T> = Result<T, MngrError>;
