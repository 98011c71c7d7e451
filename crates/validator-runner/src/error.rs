use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a run did not produce an exit status.
///
/// Display text is sent to the dashboard, so OS error detail stays in the source chain
/// and only reaches the logs.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Script not found: {}", path.display())]
    ScriptNotFound { path: PathBuf },
    #[error("Failed to launch {}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to allocate output capture")]
    Capture(#[source] io::Error),
    #[error("Failed to read diagnostic stream")]
    Diagnostics(#[source] io::Error),
    #[error("Failed to wait for script")]
    Wait(#[source] io::Error),
    #[error("Failed to read captured output")]
    ReadOutput(#[source] io::Error),
    #[error("Timed out after {}s", after.as_secs())]
    TimedOut {
        after: Duration,
        partial_output: String,
    },
    #[error("Cancelled")]
    Cancelled,
    #[error("Event receiver disconnected")]
    Disconnected,
}

impl RunError {
    pub(crate) fn spawn(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                RunError::ScriptNotFound { path }
            }
            _ => RunError::Spawn { path, source },
        }
    }

    /// Output worth showing alongside the error, if any was captured.
    pub fn partial_output(&self) -> Option<String> {
        match self {
            RunError::TimedOut { partial_output, .. } => Some(partial_output.clone()),
            _ => None,
        }
    }

    /// The run was abandoned by its caller rather than failing on its own.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RunError::Cancelled | RunError::Disconnected)
    }
}
