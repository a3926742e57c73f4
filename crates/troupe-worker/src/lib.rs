//! # troupe-worker
//!
//! The local worker supervisor: owns one agent identity on the bus,
//! executes at most one external subprocess at a time in the operator's
//! repository, streams its output as progress envelopes, and reports
//! terminal state.

pub mod checks;
pub mod supervisor;

pub use checks::{run_startup_checks, StartupError};
pub use supervisor::Supervisor;
