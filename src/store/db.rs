use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::{EventStore, RunRepository};
use crate::errors::RunError;
use crate::run::{
    ArtifactRef, FailureKind, NewRunEvent, Run, RunEvent, RunEventType, RunId, RunSnapshot,
    StepDuration, WorkflowState,
};

/// Async-safe handle to the run database.
///
/// Wraps `RunDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O
/// never ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<RunDb>>,
}

impl DbHandle {
    pub fn new(db: RunDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RunDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct RunDb {
    conn: Connection,
}

impl RunDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id TEXT PRIMARY KEY,
                    prompt TEXT NOT NULL,
                    project_name TEXT,
                    state TEXT NOT NULL DEFAULT 'init',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    current_step_started_at TEXT,
                    failure_reason TEXT,
                    failure_kind TEXT,
                    approval_summary TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    artifact_type TEXT NOT NULL,
                    path TEXT NOT NULL,
                    step TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_step_durations (
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step TEXT NOT NULL,
                    duration_ms INTEGER NOT NULL,
                    PRIMARY KEY (run_id, step)
                );

                CREATE TABLE IF NOT EXISTS run_events (
                    id TEXT PRIMARY KEY,
                    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL DEFAULT '{}',
                    timestamp TEXT NOT NULL,
                    UNIQUE(run_id, seq)
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_run_artifacts_path
                    ON run_artifacts(run_id, path COLLATE NOCASE);
                CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO runs (id, prompt, project_name, state, retry_count, current_step_started_at,
                               failure_reason, failure_kind, approval_summary, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                run.id().to_string(),
                run.prompt(),
                run.project_name(),
                run.state().as_str(),
                run.retry_count(),
                run.current_step_started_at().map(format_ts),
                run.failure_reason(),
                run.failure_kind().map(|k| k.as_str()),
                run.approval_summary(),
                format_ts(run.created_at()),
                format_ts(run.updated_at()),
            ],
        )
        .context("Failed to insert run")?;
        write_children(&tx, run)?;
        tx.commit().context("Failed to commit run insert")?;
        Ok(())
    }

    /// Persist the full run. Returns `false` if no such run exists.
    pub fn update_run(&self, run: &Run) -> Result<bool> {
        // Use unchecked_transaction so the row, artifacts and durations land together.
        // DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE runs SET state = ?1, retry_count = ?2, current_step_started_at = ?3,
                        failure_reason = ?4, failure_kind = ?5, approval_summary = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    run.state().as_str(),
                    run.retry_count(),
                    run.current_step_started_at().map(format_ts),
                    run.failure_reason(),
                    run.failure_kind().map(|k| k.as_str()),
                    run.approval_summary(),
                    format_ts(run.updated_at()),
                    run.id().to_string(),
                ],
            )
            .context("Failed to update run")?;
        if changed == 0 {
            return Ok(false);
        }
        write_children(&tx, run)?;
        tx.commit().context("Failed to commit run update")?;
        Ok(true)
    }

    pub fn get_run(&self, id: RunId) -> Result<Option<Run>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, prompt, project_name, state, retry_count, current_step_started_at,
                        failure_reason, failure_kind, approval_summary, created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(RunRow {
                        id: row.get(0)?,
                        prompt: row.get(1)?,
                        project_name: row.get(2)?,
                        state: row.get(3)?,
                        retry_count: row.get(4)?,
                        current_step_started_at: row.get(5)?,
                        failure_reason: row.get(6)?,
                        failure_kind: row.get(7)?,
                        approval_summary: row.get(8)?,
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .context("Failed to query run")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let snapshot = row.into_snapshot()?;
        let artifacts = self.get_artifacts(id)?;
        let durations = self.get_step_durations(id)?;
        Ok(Some(Run::restore(snapshot, artifacts, durations)))
    }

    fn get_artifacts(&self, run_id: RunId) -> Result<Vec<ArtifactRef>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT artifact_type, path, step, created_at
                 FROM run_artifacts WHERE run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare get_artifacts")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (artifact_type, path, step, created_at) =
                row.context("Failed to read artifact row")?;
            artifacts.push(ArtifactRef {
                artifact_type,
                path,
                step: parse_state(&step)?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(artifacts)
    }

    fn get_step_durations(&self, run_id: RunId) -> Result<Vec<StepDuration>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT step, duration_ms FROM run_step_durations
                 WHERE run_id = ?1 ORDER BY rowid",
            )
            .context("Failed to prepare get_step_durations")?;
        let rows = stmt
            .query_map(params![run_id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query step durations")?;
        let mut durations = Vec::new();
        for row in rows {
            let (step, duration_ms) = row.context("Failed to read step duration row")?;
            durations.push(StepDuration {
                step: parse_state(&step)?,
                duration_ms,
            });
        }
        Ok(durations)
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Append an event with the next `seq` for its run. The timestamp is
    /// clamped so it never precedes the run's previous event.
    pub fn append_event(&self, event: &NewRunEvent) -> Result<RunEvent> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let run_id = event.run_id.to_string();

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, timestamp FROM run_events WHERE run_id = ?1
                 ORDER BY seq DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read last event")?;

        let (seq, timestamp) = match last {
            Some((last_seq, last_ts)) => {
                let last_ts = parse_ts(&last_ts)?;
                (last_seq + 1, event.timestamp.max(last_ts))
            }
            None => (1, event.timestamp),
        };

        let payload =
            serde_json::to_string(&event.payload).context("Failed to serialize event payload")?;
        tx.execute(
            "INSERT INTO run_events (id, run_id, seq, event_type, payload, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                run_id,
                seq,
                event.event_type.as_str(),
                payload,
                format_ts(timestamp),
            ],
        )
        .context("Failed to insert run event")?;
        tx.commit().context("Failed to commit run event")?;

        Ok(RunEvent {
            id: event.id,
            run_id: event.run_id,
            seq,
            timestamp,
            event_type: event.event_type,
            payload: event.payload.clone(),
        })
    }

    pub fn events_for_run(&self, run_id: RunId) -> Result<Vec<RunEvent>> {
        self.query_events(
            "SELECT id, run_id, seq, event_type, payload, timestamp
             FROM run_events WHERE run_id = ?1 ORDER BY seq",
            params![run_id.to_string()],
        )
    }

    /// The `limit` most recent events, returned oldest first.
    pub fn latest_events(&self, run_id: RunId, limit: usize) -> Result<Vec<RunEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut events = self.query_events(
            "SELECT id, run_id, seq, event_type, payload, timestamp
             FROM run_events WHERE run_id = ?1 ORDER BY seq DESC LIMIT ?2",
            params![run_id.to_string(), limit],
        )?;
        events.reverse();
        Ok(events)
    }

    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RunEvent>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare event query")?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(RunEventRow {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    seq: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: row.get(4)?,
                    timestamp: row.get(5)?,
                })
            })
            .context("Failed to query run events")?;
        let mut events = Vec::new();
        for row in rows {
            let r = row.context("Failed to read run event row")?;
            events.push(r.into_run_event()?);
        }
        Ok(events)
    }
}

fn write_children(tx: &rusqlite::Transaction<'_>, run: &Run) -> Result<()> {
    let run_id = run.id().to_string();
    for artifact in run.artifacts() {
        tx.execute(
            "INSERT OR IGNORE INTO run_artifacts (run_id, artifact_type, path, step, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                artifact.artifact_type,
                artifact.path,
                artifact.step.as_str(),
                format_ts(artifact.created_at),
            ],
        )
        .context("Failed to write artifact")?;
    }
    for duration in run.step_durations() {
        tx.execute(
            "INSERT INTO run_step_durations (run_id, step, duration_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id, step) DO UPDATE SET duration_ms = excluded.duration_ms",
            params![run_id, duration.step.as_str(), duration.duration_ms],
        )
        .context("Failed to write step duration")?;
    }
    Ok(())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp in database: '{}'", s))
}

fn parse_state(s: &str) -> Result<WorkflowState> {
    s.parse::<WorkflowState>()
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse workflow state")
}

/// Intermediate row struct for runs.
struct RunRow {
    id: String,
    prompt: String,
    project_name: Option<String>,
    state: String,
    retry_count: i64,
    current_step_started_at: Option<String>,
    failure_reason: Option<String>,
    failure_kind: Option<String>,
    approval_summary: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_snapshot(self) -> Result<RunSnapshot> {
        let id = self
            .id
            .parse::<RunId>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse run id")?;
        let failure_kind = self
            .failure_kind
            .map(|k| k.parse::<FailureKind>().map_err(|e| anyhow::anyhow!(e)))
            .transpose()
            .context("Failed to parse failure kind")?;
        Ok(RunSnapshot {
            id,
            prompt: self.prompt,
            project_name: self.project_name,
            state: parse_state(&self.state)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            retry_count: u32::try_from(self.retry_count).context("retry_count out of range")?,
            current_step_started_at: self
                .current_step_started_at
                .as_deref()
                .map(parse_ts)
                .transpose()?,
            failure_reason: self.failure_reason,
            failure_kind,
            approval_summary: self.approval_summary,
        })
    }
}

/// Intermediate row struct for run_events.
struct RunEventRow {
    id: String,
    run_id: String,
    seq: i64,
    event_type: String,
    payload: String,
    timestamp: String,
}

impl RunEventRow {
    fn into_run_event(self) -> Result<RunEvent> {
        let event_type = self
            .event_type
            .parse::<RunEventType>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event type")?;
        let payload = serde_json::from_str(&self.payload)
            .with_context(|| format!("corrupt event payload JSON '{}'", self.payload))?;
        Ok(RunEvent {
            id: self
                .id
                .parse::<uuid::Uuid>()
                .context("Failed to parse event id")?,
            run_id: self
                .run_id
                .parse::<RunId>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse event run id")?,
            seq: self.seq,
            timestamp: parse_ts(&self.timestamp)?,
            event_type,
            payload,
        })
    }
}

// ── Store ─────────────────────────────────────────────────────────────

/// [`RunRepository`] and [`EventStore`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Open the database file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::new(DbHandle::new(RunDb::new(path)?)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(DbHandle::new(RunDb::new_in_memory()?)))
    }
}

#[async_trait]
impl RunRepository for SqliteStore {
    async fn get_run(&self, id: RunId) -> Result<Run, RunError> {
        self.db
            .call(move |db| db.get_run(id))
            .await
            .map_err(RunError::storage)?
            .ok_or(RunError::RunNotFound { id })
    }

    async fn insert_run(&self, run: &Run) -> Result<(), RunError> {
        let run = run.clone();
        self.db
            .call(move |db| db.insert_run(&run))
            .await
            .map_err(RunError::storage)
    }

    async fn update_run(&self, run: &Run) -> Result<(), RunError> {
        let id = run.id();
        let run = run.clone();
        let found = self
            .db
            .call(move |db| db.update_run(&run))
            .await
            .map_err(RunError::storage)?;
        if found {
            Ok(())
        } else {
            Err(RunError::RunNotFound { id })
        }
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn append_event(&self, event: NewRunEvent) -> Result<RunEvent, RunError> {
        self.db
            .call(move |db| db.append_event(&event))
            .await
            .map_err(RunError::storage)
    }

    async fn events_for_run(&self, run_id: RunId) -> Result<Vec<RunEvent>, RunError> {
        self.db
            .call(move |db| db.events_for_run(run_id))
            .await
            .map_err(RunError::storage)
    }

    async fn latest_events(&self, run_id: RunId, limit: usize) -> Result<Vec<RunEvent>, RunError> {
        self.db
            .call(move |db| db.latest_events(run_id, limit))
            .await
            .map_err(RunError::storage)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
