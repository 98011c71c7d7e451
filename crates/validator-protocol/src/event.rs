use serde::{Deserialize, Serialize};
use serde_json::json;

/// One step of a run, in the order it happened.
///
/// Every run ends with exactly one terminal event: [`RunEvent::Completed`] or
/// [`RunEvent::Failed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Log {
        line: String,
    },
    Completed {
        output: String,
    },
    Failed {
        error: String,
        #[serde(default)]
        partial_output: Option<String>,
    },
}

impl RunEvent {
    pub fn log(line: impl Into<String>) -> Self {
        RunEvent::Log { line: line.into() }
    }

    pub fn completed(output: impl Into<String>) -> Self {
        RunEvent::Completed {
            output: output.into(),
        }
    }

    pub fn failed(error: impl Into<String>, partial_output: Option<String>) -> Self {
        RunEvent::Failed {
            error: error.into(),
            partial_output,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunEvent::Log { .. })
    }

    /// SSE event name understood by the dashboard client.
    pub fn wire_name(&self) -> &'static str {
        match self {
            RunEvent::Log { .. } => "log",
            RunEvent::Completed { .. } => "complete",
            RunEvent::Failed { .. } => "cmd_error",
        }
    }

    /// JSON payload for the SSE `data:` field.
    pub fn wire_data(&self) -> serde_json::Value {
        match self {
            RunEvent::Log { line } => json!({ "line": line }),
            RunEvent::Completed { output } => json!({ "stdout": output }),
            RunEvent::Failed {
                error,
                partial_output: Some(output),
            } => json!({ "error": error, "stdout": output }),
            RunEvent::Failed {
                error,
                partial_output: None,
            } => json!({ "error": error }),
        }
    }

    /// Full SSE frame: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.wire_name(), self.wire_data())
    }
}
