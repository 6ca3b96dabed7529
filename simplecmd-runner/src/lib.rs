//! Supervised execution of external processes: timeout, kill and combined
//! output capture behind a single result type.

pub mod executor;
pub mod process;

pub use executor::ProcessRunner;
pub use process::{CaptureBuffer, Sink};
pub use simplecmd_core::{
    CommandSpec, ExecutionResult, Outcome, SimpleCmdError, Status, ERR_CODE, ERR_CODE_PROCESS,
};
