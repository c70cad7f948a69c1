//! Inbound line decoder and reader task.
//!
//! Reads newline-delimited JSON from an agent's stdout, decodes each line and
//! hands the result to an [`InboundSink`]. The sink decides what happens to
//! control responses, continuation ids and events; this module only
//! classifies.
//!
//! Lines that are not JSON are logged and skipped. They never terminate the
//! reader. Every line that parses as JSON becomes an event or a control
//! response, whatever its shape.

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::StreamCodec;
use crate::protocol::messages::{ControlEnvelope, ControlResponse, Event};
use crate::{AppError, Result};

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Conversational or system event.
    Event(Event),
    /// Reply correlated to an outbound control request.
    ControlResponse(ControlResponse),
}

/// Receiver of decoded traffic for one process lifetime.
pub trait InboundSink: Send + Sync {
    /// A `control_response` arrived.
    fn control_response(&self, response: ControlResponse);

    /// The first `init` of this process lifetime announced `continuation_id`.
    fn first_init(&self, continuation_id: &str);

    /// Any other event, in arrival order.
    fn event(&self, event: Event);
}

/// Why [`run_reader`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The agent closed its stdout.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// The underlying pipe failed.
    Failed(String),
}

/// Decode a single stdout line.
///
/// # Return value
///
/// - `Ok(Some(inbound))` — a complete message.
/// - `Ok(None)` — the line is empty or whitespace.
///
/// # Errors
///
/// - [`AppError::Protocol`]`("malformed json: …")` — not valid JSON.
/// - [`AppError::Protocol`]`("invalid control_response: …")` — a
///   `control_response` without a usable `response` object.
pub fn decode_line(line: &str) -> Result<Option<Inbound>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|e| AppError::Protocol(format!("malformed json: {e}")))?;

    if value.get("type").and_then(Value::as_str) == Some("control_response") {
        let envelope: ControlEnvelope = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("invalid control_response: {e}")))?;
        return Ok(Some(Inbound::ControlResponse(envelope.response)));
    }

    Ok(Some(Inbound::Event(Event::from_value(value))))
}

/// Per-process decoding state.
///
/// Tracks whether the process has already announced itself, so only the
/// first `init` of a lifetime reaches [`InboundSink::first_init`]. An `init`
/// without a session id still counts as the first one but reports nothing.
#[derive(Debug, Default)]
pub struct Decoder {
    init_seen: bool,
}

impl Decoder {
    /// Fresh decoder for a newly spawned process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `line` and dispatch it to `sink`.
    ///
    /// # Errors
    ///
    /// Propagates [`decode_line`] errors; nothing is dispatched in that case.
    pub fn dispatch<S: InboundSink + ?Sized>(&mut self, line: &str, sink: &S) -> Result<()> {
        match decode_line(line)? {
            None => {}
            Some(Inbound::ControlResponse(response)) => sink.control_response(response),
            Some(Inbound::Event(event)) => {
                if let Event::Init(init) = &event {
                    if !self.init_seen {
                        self.init_seen = true;
                        if !init.session_id.is_empty() {
                            sink.first_init(&init.session_id);
                        }
                    }
                }
                sink.event(event);
            }
        }
        Ok(())
    }
}

/// Reader task body — frames `stdout` and dispatches every line to `sink`.
///
/// Returns when the stream ends, fails, or `cancel` fires. Over-long and
/// malformed lines are logged at `WARN` and skipped.
pub async fn run_reader<R, S>(
    pid: u32,
    stdout: R,
    max_line_bytes: usize,
    sink: &S,
    cancel: &CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
    S: InboundSink + ?Sized,
{
    let mut framed = FramedRead::new(stdout, StreamCodec::with_max_line_bytes(max_line_bytes));
    let mut decoder = Decoder::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(pid, "reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(pid, "reader: EOF detected");
                        return ReaderExit::Eof;
                    }

                    Some(Err(AppError::Protocol(ref msg))) => {
                        warn!(pid, error = msg.as_str(), "reader: framing error, skipping line");
                    }

                    Some(Err(e)) => {
                        warn!(pid, error = %e, "reader: stream error, stopping");
                        return ReaderExit::Failed(e.to_string());
                    }

                    Some(Ok(line)) => {
                        if let Err(e) = decoder.dispatch(&line, sink) {
                            warn!(
                                pid,
                                error = %e,
                                raw_line = %line,
                                "reader: decode error, skipping line"
                            );
                        }
                    }
                }
            }
        }
    }
}
