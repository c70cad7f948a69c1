#![forbid(unsafe_code)]

//! Session engine for a long-running stream-json agent process.
//!
//! - [`protocol`] frames and classifies the agent's NDJSON output.
//! - [`engine`] supervises the process, runs single-flight queries, and
//!   recovers from interrupts by respawning with a resume directive.
//! - [`session`] decides when an engine can be reused for a new
//!   configuration.

pub mod config;
pub mod engine;
pub mod errors;
pub mod protocol;
pub mod session;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStatus, ProcessInfo, QueryOutcome, QueryStream};
pub use errors::{AppError, Result};
pub use protocol::messages::Event;
pub use session::{SessionRegistry, SessionSlot};
