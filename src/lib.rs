//! Run orchestration engine.
//!
//! A run moves through generation stages (`spec` to `infra`), parks at an
//! approval gate, then deploys. Each `advance` executes the current stage at
//! most once, writes its artifact into the run's workspace and appends to a
//! durable per-run event log that subscribers can replay and tail.

pub mod config;
pub mod errors;
pub mod events;
pub mod locks;
pub mod logging;
pub mod orchestrator;
pub mod run;
pub mod server;
pub mod store;
pub mod workspace;
