//! Typed error enums for the ledger and the dispatch protocol.

use std::path::PathBuf;

use fleet_common::{TaskStatus, codes};
use thiserror::Error;

// ── Ledger errors ─────────────────────────────────────────────────────────────

/// Failures of the ledger. Persistence variants never undo the in-memory change.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to write snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {table} table: {source}")]
    Serialize {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("task '{task_id}' cannot move from {from} to {to}")]
    StatusRegression {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl LedgerError {
    /// Snapshot I/O or encoding failed; the in-memory table is still authoritative.
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        !matches!(self, LedgerError::StatusRegression { .. })
    }
}

// ── Dispatch errors ───────────────────────────────────────────────────────────

/// Protocol-level failures returned to agents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("invalid session token for agent '{0}'")]
    Unauthenticated(String),

    #[error("task '{task_id}' is not running on agent '{agent_id}'")]
    TaskNotOwned { task_id: String, agent_id: String },

    #[error("invalid request: {0}")]
    ValidationFailed(String),
}

impl DispatchError {
    /// Wire code carried in the error body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::AgentNotFound(_) | DispatchError::TaskNotFound(_) => codes::NOT_FOUND,
            DispatchError::Unauthenticated(_) => codes::UNAUTHENTICATED,
            DispatchError::TaskNotOwned { .. } => codes::TASK_NOT_OWNED,
            DispatchError::ValidationFailed(_) => codes::VALIDATION_FAILED,
        }
    }
}
