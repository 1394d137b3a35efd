use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Hyphen-free form, used for per-run workspace directory names.
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for RunId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| format!("Invalid run id '{}': {}", s, e))
    }
}

/// Pipeline position of a run.
///
/// The forward path is strictly linear; `Done` and `Fail` are absorbing.
/// `Fail` is never reached through [`WorkflowState::next`], only through
/// explicit reject/fail actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Init,
    Spec,
    Plan,
    AppCode,
    Test,
    Security,
    Infra,
    WaitingForApproval,
    Deploy,
    Done,
    Fail,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 11] = [
        Self::Init,
        Self::Spec,
        Self::Plan,
        Self::AppCode,
        Self::Test,
        Self::Security,
        Self::Infra,
        Self::WaitingForApproval,
        Self::Deploy,
        Self::Done,
        Self::Fail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Spec => "spec",
            Self::Plan => "plan",
            Self::AppCode => "app_code",
            Self::Test => "test",
            Self::Security => "security",
            Self::Infra => "infra",
            Self::WaitingForApproval => "waiting_for_approval",
            Self::Deploy => "deploy",
            Self::Done => "done",
            Self::Fail => "fail",
        }
    }

    /// The only state reachable from `self` on the forward path.
    pub fn next(&self) -> Option<WorkflowState> {
        match self {
            Self::Init => Some(Self::Spec),
            Self::Spec => Some(Self::Plan),
            Self::Plan => Some(Self::AppCode),
            Self::AppCode => Some(Self::Test),
            Self::Test => Some(Self::Security),
            Self::Security => Some(Self::Infra),
            Self::Infra => Some(Self::WaitingForApproval),
            Self::WaitingForApproval => Some(Self::Deploy),
            Self::Deploy => Some(Self::Done),
            Self::Done | Self::Fail => None,
        }
    }

    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        self.next() == Some(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Fail)
    }

    /// States in which `advance` is a no-op.
    pub fn is_parked(&self) -> bool {
        matches!(self, Self::WaitingForApproval | Self::Done | Self::Fail)
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Invalid workflow state: {}", s))
    }
}

/// Why a run ended up in `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A human rejected the run at the approval gate (or earlier).
    Rejected,
    /// Infrastructure or operator abort.
    System,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::System => "system",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rejected" => Ok(Self::Rejected),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid failure kind: {}", s)),
        }
    }
}

/// Provenance record for an artifact written by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub artifact_type: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub step: WorkflowState,
}

/// Wall-clock time spent in a stage. Re-entering a stage replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDuration {
    pub step: WorkflowState,
    pub duration_ms: i64,
}

impl StepDuration {
    pub fn new(step: WorkflowState, duration: TimeDelta) -> Self {
        Self {
            step,
            duration_ms: duration.num_milliseconds(),
        }
    }

    pub fn duration(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.duration_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    StateChanged,
    StepStarted,
    StepCompleted,
    ArtifactWritten,
    ValidationFailed,
    RunFailed,
    RunCompleted,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChanged => "state_changed",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::ArtifactWritten => "artifact_written",
            Self::ValidationFailed => "validation_failed",
            Self::RunFailed => "run_failed",
            Self::RunCompleted => "run_completed",
        }
    }
}

impl fmt::Display for RunEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "state_changed" => Ok(Self::StateChanged),
            "step_started" => Ok(Self::StepStarted),
            "step_completed" => Ok(Self::StepCompleted),
            "artifact_written" => Ok(Self::ArtifactWritten),
            "validation_failed" => Ok(Self::ValidationFailed),
            "run_failed" => Ok(Self::RunFailed),
            "run_completed" => Ok(Self::RunCompleted),
            _ => Err(format!("Invalid run event type: {}", s)),
        }
    }
}

/// An event that has not been appended yet; the store assigns `seq`.
#[derive(Debug, Clone)]
pub struct NewRunEvent {
    pub id: Uuid,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: RunEventType,
    pub payload: serde_json::Value,
}

impl NewRunEvent {
    pub fn new(run_id: RunId, event_type: RunEventType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            timestamp: Utc::now(),
            event_type,
            payload,
        }
    }
}

/// A persisted, immutable entry of a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: Uuid,
    pub run_id: RunId,
    /// Per-run position, strictly increasing in append order.
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: RunEventType,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_state_roundtrip() {
        for state in WorkflowState::ALL {
            let parsed: WorkflowState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("invalid".parse::<WorkflowState>().is_err());
    }

    #[test]
    fn test_forward_path_visits_every_non_fail_state_once() {
        let mut state = WorkflowState::Init;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(state, WorkflowState::Done);
        assert_eq!(visited.len(), WorkflowState::ALL.len() - 1);
        assert!(!visited.contains(&WorkflowState::Fail));
    }

    #[test]
    fn test_parked_states() {
        assert!(WorkflowState::WaitingForApproval.is_parked());
        assert!(WorkflowState::Done.is_parked());
        assert!(WorkflowState::Fail.is_parked());
        assert!(!WorkflowState::Deploy.is_parked());
        assert!(!WorkflowState::WaitingForApproval.is_terminal());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&WorkflowState::WaitingForApproval).unwrap(),
            "\"waiting_for_approval\""
        );
        assert_eq!(
            serde_json::to_string(&RunEventType::ArtifactWritten).unwrap(),
            "\"artifact_written\""
        );
        assert_eq!(
            serde_json::from_str::<WorkflowState>("\"app_code\"").unwrap(),
            WorkflowState::AppCode
        );
    }

    #[test]
    fn test_run_event_type_roundtrip() {
        for s in &[
            "state_changed",
            "step_started",
            "step_completed",
            "artifact_written",
            "validation_failed",
            "run_failed",
            "run_completed",
        ] {
            let parsed: RunEventType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunEventType>().is_err());
    }

    #[test]
    fn test_run_id_parse_and_simple_form() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.simple().len(), 32);
        assert!(!id.simple().contains('-'));
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }

    #[test]
    fn test_step_duration_keeps_millis() {
        let d = StepDuration::new(WorkflowState::Plan, TimeDelta::milliseconds(1500));
        assert_eq!(d.duration_ms, 1500);
        assert_eq!(d.duration(), TimeDelta::milliseconds(1500));
    }

    #[test]
    fn test_artifact_ref_serializes_type_field() {
        let artifact = ArtifactRef {
            artifact_type: "spec.json".into(),
            path: "/ws/abc/spec.json".into(),
            created_at: Utc::now(),
            step: WorkflowState::Spec,
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["type"], "spec.json");
        assert_eq!(json["step"], "spec");
    }
}
