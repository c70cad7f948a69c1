//! Outbound writer task.
//!
//! Receives JSON values from an [`mpsc`] channel, serialises each one to a
//! compact single line and writes it to the agent's stdin. The channel has a
//! single producer side per process: the engine.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Writer task body — serialises outbound messages to `stdin` as NDJSON.
///
/// Exits cleanly when `cancel` fires or every sender is dropped. Dropping
/// `stdin` on exit closes the agent's input.
///
/// # Errors
///
/// - [`AppError::Protocol`] if a value cannot be serialised.
/// - [`AppError::Io`]`("write failed: …")` if the pipe is gone.
pub async fn run_writer<W>(
    pid: u32,
    mut stdin: W,
    mut msg_rx: mpsc::Receiver<serde_json::Value>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(pid, "writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(value) = msg else {
                    debug!(pid, "writer: message channel closed, stopping");
                    break;
                };

                let mut bytes = serde_json::to_vec(&value).map_err(|e| {
                    AppError::Protocol(format!("failed to serialise outbound message: {e}"))
                })?;
                bytes.push(b'\n');

                if let Err(e) = write_line(&mut stdin, &bytes).await {
                    warn!(pid, error = %e, "writer: write to stdin failed");
                    return Err(AppError::Io(format!("write failed: {e}")));
                }
            }
        }
    }

    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(stdin: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}
