use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use validator_protocol::RunEvent;

use crate::error::RunError;

pub(crate) async fn emit(events: &mpsc::Sender<RunEvent>, event: RunEvent) -> Result<(), RunError> {
    events.send(event).await.map_err(|_| RunError::Disconnected)
}

/// Relays each non-empty diagnostic line as a log event, keeping a copy in `lines`.
///
/// Bytes that are not valid UTF-8 are replaced rather than failing the run.
pub(crate) async fn relay_lines<R: AsyncRead + Unpin>(
    reader: R,
    events: &mpsc::Sender<RunEvent>,
    lines: &mut Vec<String>,
) -> Result<(), RunError> {
    let mut reader = BufReader::new(reader);
    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let n = reader
            .read_until(b'\n', &mut buffer)
            .await
            .map_err(RunError::Diagnostics)?;
        if n == 0 {
            break;
        }
        let decoded = String::from_utf8_lossy(&buffer);
        let line = decoded.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        emit(events, RunEvent::log(line)).await?;
        lines.push(line.to_string());
    }
    Ok(())
}
