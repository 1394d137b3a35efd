//! Run domain: identifiers, workflow states, events and the [`Run`] aggregate.

mod aggregate;
mod models;

pub use aggregate::{Run, RunSnapshot};
pub use models::{
    ArtifactRef, FailureKind, NewRunEvent, RunEvent, RunEventType, RunId, StepDuration,
    WorkflowState,
};
