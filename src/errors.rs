//! Typed error hierarchy for the run orchestration engine.
//!
//! `RunError` is the only error that crosses a component boundary. Internal
//! plumbing (SQLite, child processes, config files) works in `anyhow` and is
//! folded into `StorageFailure` or `CapabilityFailure` at the edge.

use thiserror::Error;

use crate::run::{RunId, WorkflowState};

/// Errors surfaced by run operations.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {id} not found")]
    RunNotFound { id: RunId },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("Run is not waiting for approval (current state: {state})")]
    NotWaitingForApproval { state: WorkflowState },

    #[error("Unsafe workspace path '{path}'")]
    UnsafePath { path: String },

    #[error("Stage {stage} failed: {source:#}")]
    CapabilityFailure {
        stage: WorkflowState,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage error: {0:#}")]
    StorageFailure(#[source] anyhow::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl RunError {
    pub fn storage(err: anyhow::Error) -> Self {
        Self::StorageFailure(err)
    }

    /// Caller-logic errors: the run was left untouched.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::NotWaitingForApproval { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RunNotFound { .. })
    }

    /// Failures after which re-invoking `advance` is the recovery path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CapabilityFailure { .. } | Self::StorageFailure(_)
        )
    }
}
