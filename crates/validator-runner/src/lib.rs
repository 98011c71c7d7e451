//! Runs the site validator script and relays its progress as [`RunEvent`]s.
//!
//! The script's stdout is captured into a private temp file while stderr is read
//! line by line, so a large stdout dump can never block the diagnostic stream.

mod args;
mod error;
mod executor;
mod process;
mod stream;

pub use args::launch_args;
pub use error::RunError;
pub use executor::{ExecutionOutcome, Runner, RunnerConfig};
pub use validator_protocol::{RunEvent, RunRequest, ValidatorCommand};
