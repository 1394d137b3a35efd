use chrono::{DateTime, Utc};
use serde::Serialize;

use super::models::{ArtifactRef, FailureKind, RunId, StepDuration, WorkflowState};
use crate::errors::RunError;

/// Scalar columns of a persisted run, used to rebuild a [`Run`] from storage.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    pub id: RunId,
    pub prompt: String,
    pub project_name: Option<String>,
    pub state: WorkflowState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub current_step_started_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub approval_summary: Option<String>,
}

/// The run aggregate: pure state plus transition rules, no I/O.
///
/// All mutation goes through the methods below so that the invariants hold:
/// artifact paths are unique (case-insensitive), there is at most one
/// duration per step, and `state` only moves along [`WorkflowState::next`]
/// except for the explicit jumps to `Fail`.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    id: RunId,
    state: WorkflowState,
    prompt: String,
    project_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    retry_count: u32,
    current_step_started_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    failure_kind: Option<FailureKind>,
    approval_summary: Option<String>,
    artifacts: Vec<ArtifactRef>,
    step_durations: Vec<StepDuration>,
}

impl Run {
    /// Create a fresh run in `Init`.
    pub fn start(now: DateTime<Utc>, prompt: &str, project_name: Option<&str>) -> Self {
        Self::with_id(RunId::new(), now, prompt, project_name)
    }

    pub fn with_id(id: RunId, now: DateTime<Utc>, prompt: &str, project_name: Option<&str>) -> Self {
        Self {
            id,
            state: WorkflowState::Init,
            prompt: prompt.to_string(),
            project_name: project_name.map(str::to_string),
            created_at: now,
            updated_at: now,
            retry_count: 0,
            current_step_started_at: None,
            failure_reason: None,
            failure_kind: None,
            approval_summary: None,
            artifacts: Vec::new(),
            step_durations: Vec::new(),
        }
    }

    /// Rebuild a run from storage. Duplicate artifacts and durations are
    /// collapsed the same way the live mutators would.
    pub fn restore(
        snapshot: RunSnapshot,
        artifacts: Vec<ArtifactRef>,
        step_durations: Vec<StepDuration>,
    ) -> Self {
        let mut run = Self {
            id: snapshot.id,
            state: snapshot.state,
            prompt: snapshot.prompt,
            project_name: snapshot.project_name,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            retry_count: snapshot.retry_count,
            current_step_started_at: snapshot.current_step_started_at,
            failure_reason: snapshot.failure_reason,
            failure_kind: snapshot.failure_kind,
            approval_summary: snapshot.approval_summary,
            artifacts: Vec::with_capacity(artifacts.len()),
            step_durations: Vec::with_capacity(step_durations.len()),
        };
        for artifact in artifacts {
            if !run.has_artifact(&artifact.path) {
                run.artifacts.push(artifact);
            }
        }
        for duration in step_durations {
            run.put_duration(duration);
        }
        run
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn project_name(&self) -> Option<&str> {
        self.project_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn current_step_started_at(&self) -> Option<DateTime<Utc>> {
        self.current_step_started_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure_kind
    }

    pub fn approval_summary(&self) -> Option<&str> {
        self.approval_summary.as_deref()
    }

    pub fn artifacts(&self) -> &[ArtifactRef] {
        &self.artifacts
    }

    pub fn step_durations(&self) -> &[StepDuration] {
        &self.step_durations
    }

    pub fn step_duration(&self, step: WorkflowState) -> Option<&StepDuration> {
        self.step_durations.iter().find(|d| d.step == step)
    }

    pub fn has_artifact(&self, path: &str) -> bool {
        self.artifacts
            .iter()
            .any(|a| a.path.eq_ignore_ascii_case(path))
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Move to `next` along the forward path, closing out the in-progress
    /// step's duration if one was started.
    pub fn transition_to(&mut self, next: WorkflowState, now: DateTime<Utc>) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        if let Some(started) = self.current_step_started_at {
            self.put_duration(StepDuration::new(self.state, now - started));
        }

        self.state = next;
        self.touch(now);
        self.current_step_started_at = None;
        Ok(())
    }

    pub fn mark_step_started(&mut self, now: DateTime<Utc>) {
        self.current_step_started_at = Some(now);
        self.touch(now);
    }

    /// Append an artifact unless one with the same path (ignoring ASCII
    /// case) is already recorded. Returns whether it was appended.
    pub fn record_artifact(
        &mut self,
        artifact_type: &str,
        path: &str,
        now: DateTime<Utc>,
        step: WorkflowState,
    ) -> bool {
        if self.has_artifact(path) {
            return false;
        }
        self.artifacts.push(ArtifactRef {
            artifact_type: artifact_type.to_string(),
            path: path.to_string(),
            created_at: now,
            step,
        });
        self.touch(now);
        true
    }

    /// Park the run at the approval gate. Only valid from `Infra`.
    pub fn request_approval(&mut self, summary: &str, now: DateTime<Utc>) -> Result<(), RunError> {
        let previous = self.approval_summary.replace(summary.to_string());
        if let Err(e) = self.transition_to(WorkflowState::WaitingForApproval, now) {
            self.approval_summary = previous;
            return Err(e);
        }
        Ok(())
    }

    pub fn approve(&mut self, now: DateTime<Utc>) -> Result<(), RunError> {
        if self.state != WorkflowState::WaitingForApproval {
            return Err(RunError::NotWaitingForApproval { state: self.state });
        }
        self.approval_summary = None;
        self.transition_to(WorkflowState::Deploy, now)
    }

    /// Human rejection. Always reaches `Fail`, bypassing the transition table.
    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) {
        self.enter_fail(FailureKind::Rejected, reason, now);
    }

    /// System or operator failure. Same terminal jump as [`Run::reject`].
    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) {
        self.enter_fail(FailureKind::System, reason, now);
    }

    pub fn increment_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.touch(now);
    }

    fn enter_fail(&mut self, kind: FailureKind, reason: &str, now: DateTime<Utc>) {
        self.state = WorkflowState::Fail;
        self.failure_reason = Some(reason.to_string());
        self.failure_kind = Some(kind);
        self.current_step_started_at = None;
        self.touch(now);
    }

    fn put_duration(&mut self, duration: StepDuration) {
        self.step_durations.retain(|d| d.step != duration.step);
        self.step_durations.push(duration);
    }

    // updated_at never moves backwards, even if the caller's clock does.
    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}
