//! Container-side CI run-task orchestrator.
//!
//! Acts as the entrypoint (often PID 1) of a task execution pod: optionally
//! runs a user-supplied background entrypoint, waits for a readiness signal,
//! launches the task agent with its token on stdin, reaps orphaned
//! grandchildren for the lifetime of the pod, and reports unrecoverable
//! failures back to the Runner API.

pub mod ca_bundle;
pub mod config;
pub mod error;
pub mod health;
pub mod init_cmd;
pub mod logging;
pub mod orchestrator;
pub mod override_cmd;
pub mod reaper;
pub mod readiness;
pub mod runner_api;
pub mod subprocess;
pub mod version;

pub use orchestrator::Orchestrator;
pub use version::Version;
