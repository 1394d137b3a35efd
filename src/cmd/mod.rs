//! CLI command implementations.
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `project` | `Init`                                                        |
//! | `serve`   | `Serve`                                                       |
//! | `run`     | `Start`, `Advance`, `Approve`, `Deploy`, `Reject`, `Fail`,    |
//! |           | `Retry`, `Show`, `Events`                                     |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod project;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use project::cmd_init;
pub use run::{
    cmd_advance, cmd_approve, cmd_deploy, cmd_events, cmd_fail, cmd_reject, cmd_retry, cmd_show,
    cmd_start,
};
pub use serve::cmd_serve;
