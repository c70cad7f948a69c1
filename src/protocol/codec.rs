//! NDJSON codec for the agent's stdout.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a per-line cap. The cap only
//! guards against a runaway writer; a well-formed stream never comes close to
//! it, and a line that exceeds it is discarded the same way a malformed line
//! is.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_tether::protocol::codec::StreamCodec;
//!
//! let reader = FramedRead::new(child_stdout, StreamCodec::new());
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted by [`StreamCodec`]: 64 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Newline-delimited JSON decoder for the agent's stdout.
///
/// Lines longer than the configured limit return
/// [`AppError::Protocol`]`("line too long: …")`; the codec then skips to the
/// next newline, so decoding resumes with the following line. Outbound lines
/// are written by [`run_writer`](crate::protocol::writer::run_writer).
#[derive(Debug)]
pub struct StreamCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl StreamCodec {
    /// Create a codec with the [`DEFAULT_MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a codec with an explicit line limit.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    /// The line limit this codec enforces.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
        }
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode(src).map_err(|e| self.map_error(e))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.inner.decode_eof(src).map_err(|e| self.map_error(e))
    }
}
