//! Unit tests for the NDJSON line codec.
//!
//! Covers framing of complete, batched and partial lines, CRLF handling, and
//! the line-length cap.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use agent_tether::protocol::codec::{StreamCodec, DEFAULT_MAX_LINE_BYTES};
use agent_tether::AppError;

// ── Framing ──────────────────────────────────────────────────────────────────

/// A complete line is returned without its trailing newline.
#[test]
fn single_line_is_decoded() {
    let mut codec = StreamCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"result\"}\n");

    let line = codec.decode(&mut buf).expect("decode must succeed");

    assert_eq!(line.as_deref(), Some("{\"type\":\"result\"}"));
}

/// Two lines in one buffer come out as two items.
#[test]
fn batched_lines_are_split() {
    let mut codec = StreamCodec::new();
    let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\n");

    let first = codec.decode(&mut buf).expect("first decode");
    let second = codec.decode(&mut buf).expect("second decode");
    let third = codec.decode(&mut buf).expect("third decode");

    assert_eq!(first.as_deref(), Some("{\"a\":1}"));
    assert_eq!(second.as_deref(), Some("{\"b\":2}"));
    assert!(third.is_none(), "buffer must be exhausted");
}

/// A line split across reads is buffered until its newline arrives.
#[test]
fn partial_line_waits_for_newline() {
    let mut codec = StreamCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"assi");

    assert!(
        codec.decode(&mut buf).expect("partial decode").is_none(),
        "no item before the newline"
    );

    buf.extend_from_slice(b"stant\"}\n");
    let line = codec.decode(&mut buf).expect("completed decode");
    assert_eq!(line.as_deref(), Some("{\"type\":\"assistant\"}"));
}

/// A trailing carriage return is stripped.
#[test]
fn crlf_is_stripped() {
    let mut codec = StreamCodec::new();
    let mut buf = BytesMut::from("{\"x\":true}\r\n");

    let line = codec.decode(&mut buf).expect("decode");

    assert_eq!(line.as_deref(), Some("{\"x\":true}"));
}

/// An unterminated final line is still delivered at EOF.
#[test]
fn final_line_without_newline_is_flushed_at_eof() {
    let mut codec = StreamCodec::new();
    let mut buf = BytesMut::from("{\"last\":1}");

    let line = codec.decode_eof(&mut buf).expect("decode_eof");

    assert_eq!(line.as_deref(), Some("{\"last\":1}"));
}

// ── Line cap ─────────────────────────────────────────────────────────────────

/// A line longer than the cap yields a protocol error.
#[test]
fn over_long_line_is_rejected() {
    let mut codec = StreamCodec::with_max_line_bytes(8);
    let mut buf = BytesMut::from("0123456789abcdef\n");

    let err = codec.decode(&mut buf).expect_err("line exceeds the cap");

    match err {
        AppError::Protocol(msg) => assert!(msg.contains("line too long"), "got {msg}"),
        other => panic!("expected Protocol error, got {other:?}"),
    }
}

/// After an over-long line, decoding resumes with the next line.
#[test]
fn decoding_resumes_after_over_long_line() {
    let mut codec = StreamCodec::with_max_line_bytes(8);
    let mut buf = BytesMut::from("0123456789abcdef\n{\"a\":1}\n");

    assert!(codec.decode(&mut buf).is_err(), "first line is too long");

    // The codec discards until the newline, possibly over several calls.
    let mut next = None;
    for _ in 0..4 {
        if let Some(line) = codec.decode(&mut buf).expect("subsequent decode") {
            next = Some(line);
            break;
        }
    }
    assert_eq!(next.as_deref(), Some("{\"a\":1}"));
}

/// The default cap is exposed and used by `new`.
#[test]
fn default_cap_is_applied() {
    assert_eq!(StreamCodec::new().max_line_bytes(), DEFAULT_MAX_LINE_BYTES);
    assert_eq!(StreamCodec::default().max_line_bytes(), DEFAULT_MAX_LINE_BYTES);
}
