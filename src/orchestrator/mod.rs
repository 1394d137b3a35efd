//! Step-advance orchestration and the command-level run service.

pub mod capability;
pub mod runner;
pub mod service;
pub mod stage;

pub use capability::{CapabilitySet, CommandCapability, EchoCapability, StageCapability};
pub use runner::{APPROVAL_SUMMARY, Orchestrator};
pub use service::{RunDetails, RunService};
pub use stage::Stage;
