//! Event log and live broadcaster.

mod broadcaster;
mod log;

pub use broadcaster::{Broadcaster, Subscription};
pub use log::EventLog;
