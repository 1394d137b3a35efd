//! Persistence boundary for runs and their event log.
//!
//! The orchestrator and event log only see the two traits below; the SQLite
//! implementation lives in [`db`].

pub mod db;

use async_trait::async_trait;

use crate::errors::RunError;
use crate::run::{NewRunEvent, Run, RunEvent, RunId};

pub use db::{DbHandle, RunDb, SqliteStore};

#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Load a run with its artifacts and step durations.
    async fn get_run(&self, id: RunId) -> Result<Run, RunError>;

    async fn insert_run(&self, run: &Run) -> Result<(), RunError>;

    /// Write the run row, artifacts and durations as one unit.
    async fn update_run(&self, run: &Run) -> Result<(), RunError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event, assigning the next per-run `seq`.
    async fn append_event(&self, event: NewRunEvent) -> Result<RunEvent, RunError>;

    /// Full history for a run, in `seq` order.
    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<RunEvent>, RunError>;

    /// The `limit` most recent events, oldest first.
    async fn latest_events(&self, run_id: RunId, limit: usize) -> Result<Vec<RunEvent>, RunError>;
}
