//! Stream-json protocol handling.
//!
//! Bidirectional NDJSON over the agent's stdio:
//! - `codec`: line framing with a hardening cap on line length.
//! - `messages`: typed inbound events and outbound payload builders.
//! - `reader`: line decoder and the stdout reader task.
//! - `writer`: the stdin writer task.

pub mod codec;
pub mod messages;
pub mod reader;
pub mod writer;
