//! Session engine.
//!
//! One [`Engine`] wraps one long-running agent process at a time and turns
//! its stream-json output into per-query event streams.
//!
//! ```text
//!   query(prompt) ──► QueryStream ◄── per-query channel ◄── Router ◄── reader task
//!                        │                                     ▲
//!                        └── stdin writer task ◄── user turn   └── driver task (exit)
//! ```
//!
//! All mutable state lives in one `EngineState` behind a mutex. Critical
//! sections are short and never span an `.await`, so `interrupt` can be
//! called from any task while a query stream is being consumed.
//!
//! Every spawned process carries a generation number. Output and exit
//! reports from a process that has since been replaced are discarded.

pub mod interrupt;
pub mod query;
pub mod supervisor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::protocol::messages::{ControlResponse, Event};
use crate::protocol::reader::InboundSink;
use crate::{AppError, Result};

pub use query::{QueryOutcome, QueryStream};
pub use supervisor::ProcessInfo;

use supervisor::{ExitReport, ProcessHandle};

// ── State ────────────────────────────────────────────────────────────────────

/// Delivered to the consumer of the active query.
#[derive(Debug)]
pub(crate) enum QuerySignal {
    Event(Event),
    Failed(AppError),
}

/// The single query currently allowed to receive events.
#[derive(Debug)]
pub(crate) struct ActiveQuery {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::UnboundedSender<QuerySignal>,
}

impl ActiveQuery {
    pub(crate) fn signal(&self, signal: QuerySignal) {
        // A closed receiver means the consumer already went away.
        let _ = self.tx.send(signal);
    }
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) continuation_id: String,
    pub(crate) process: Option<ProcessHandle>,
    pub(crate) generation: u64,
    pub(crate) active: Option<ActiveQuery>,
    pub(crate) next_query_id: u64,
    pub(crate) terminal_error: Option<AppError>,
    pub(crate) interrupted: bool,
    pub(crate) needs_recreation: bool,
    pub(crate) stopped: bool,
    pub(crate) pending_control: HashMap<String, oneshot::Sender<ControlResponse>>,
    pub(crate) next_control_id: u64,
}

#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<EngineState>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Coarse lifecycle view of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// A process is live and no query is running.
    Ready,
    /// A query owns the event stream.
    Querying,
    /// The next query will replace the process first.
    PendingRecreation,
    /// A terminal error is recorded; queries fail with it.
    Failed(AppError),
    /// The engine was stopped.
    Stopped,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Session engine around one agent process.
///
/// Cheap to share by reference across tasks; all methods take `&self`.
/// Dropping the engine terminates its process.
#[derive(Debug)]
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
}

impl Engine {
    /// Spawn an engine that starts a new conversation.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the agent process cannot be started.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn(config: EngineConfig) -> Result<Self> {
        Self::spawn_resuming(config, String::new())
    }

    /// Spawn an engine that resumes `continuation_id` when it is non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] if the agent process cannot be started.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_resuming(config: EngineConfig, continuation_id: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                config,
                continuation_id: continuation_id.into(),
                process: None,
                generation: 0,
                active: None,
                next_query_id: 0,
                terminal_error: None,
                interrupted: false,
                needs_recreation: false,
                stopped: false,
                pending_control: HashMap::new(),
                next_control_id: 0,
            }),
        });

        {
            let mut state = shared.lock();
            state.generation = 1;
            let router = Router::new(Arc::downgrade(&shared), state.generation);
            let handle =
                supervisor::spawn_process(&state.config, &state.continuation_id, 1, router)?;
            state.process = Some(handle);
        }

        Ok(Self { shared })
    }

    /// Continuation id of the conversation; empty until the agent announces one.
    #[must_use]
    pub fn continuation_id(&self) -> String {
        self.shared.lock().continuation_id.clone()
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> EngineConfig {
        self.shared.lock().config.clone()
    }

    /// Details of the live process, if any.
    #[must_use]
    pub fn process_info(&self) -> Option<ProcessInfo> {
        self.shared
            .lock()
            .process
            .as_ref()
            .map(|handle| handle.info.clone())
    }

    /// Whether a query currently owns the event stream.
    #[must_use]
    pub fn is_query_active(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Whether the next query will spawn a replacement process first.
    #[must_use]
    pub fn needs_recreation(&self) -> bool {
        self.shared.lock().needs_recreation
    }

    /// Whether the active query is being cancelled.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.shared.lock().interrupted
    }

    /// The recorded terminal error, if any.
    #[must_use]
    pub fn terminal_error(&self) -> Option<AppError> {
        self.shared.lock().terminal_error.clone()
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        let state = self.shared.lock();
        if state.stopped {
            EngineStatus::Stopped
        } else if state.active.is_some() {
            EngineStatus::Querying
        } else if state.needs_recreation {
            EngineStatus::PendingRecreation
        } else if let Some(err) = &state.terminal_error {
            EngineStatus::Failed(err.clone())
        } else {
            EngineStatus::Ready
        }
    }

    /// Stop the engine and wait for its process to be reaped.
    ///
    /// The active query, if any, ends with [`AppError::Closed`]. Later calls
    /// to [`Engine::query`] fail the same way. Idempotent.
    pub async fn stop(&self) {
        let handle = {
            let mut state = self.shared.lock();
            close_locked(&mut state)
        };
        if let Some(handle) = handle {
            info!(pid = handle.info.pid, "stopping engine");
            supervisor::terminate(handle).await;
        }
    }

    /// Replace the process while holding the state lock.
    ///
    /// Clears the stale flags and terminal error first. A spawn failure is
    /// recorded as the new terminal error.
    pub(crate) fn respawn_locked(
        shared: &Arc<Shared>,
        state: &mut EngineState,
    ) -> Result<()> {
        if let Some(stale) = state.process.take() {
            debug!(pid = stale.info.pid, "dropping stale process before respawn");
        }
        state.interrupted = false;
        state.needs_recreation = false;
        state.terminal_error = None;
        state.pending_control.clear();
        state.generation += 1;

        let router = Router::new(Arc::downgrade(shared), state.generation);
        match supervisor::spawn_process(
            &state.config,
            &state.continuation_id,
            state.generation,
            router,
        ) {
            Ok(handle) => {
                info!(
                    pid = handle.info.pid,
                    generation = state.generation,
                    "agent process recreated"
                );
                state.process = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!(%err, "failed to recreate agent process");
                state.terminal_error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let handle = close_locked(&mut self.shared.lock());
        drop(handle);
    }
}

/// Mark the engine stopped and detach its process for termination.
fn close_locked(state: &mut EngineState) -> Option<ProcessHandle> {
    if !state.stopped {
        state.stopped = true;
        state.terminal_error = Some(AppError::Closed("engine stopped".into()));
    }
    if let Some(active) = state.active.take() {
        active.signal(QuerySignal::Failed(AppError::Closed("engine stopped".into())));
    }
    state.pending_control.clear();
    state.process.take()
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Routes one process's decoded traffic into the engine state.
pub(crate) struct Router {
    shared: Weak<Shared>,
    generation: u64,
}

impl Router {
    pub(crate) fn new(shared: Weak<Shared>, generation: u64) -> Self {
        Self { shared, generation }
    }

    /// Run `f` against the state only if this router's process is current.
    fn with_current<F>(&self, f: F)
    where
        F: FnOnce(&mut EngineState),
    {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.lock();
        if state.generation != self.generation {
            debug!(
                generation = self.generation,
                current = state.generation,
                "ignoring traffic from replaced process"
            );
            return;
        }
        f(&mut *state);
    }

    /// Record how the process ended and fail the active query if needed.
    pub(crate) fn exited(&self, report: &ExitReport) {
        self.with_current(|state| {
            state.pending_control.clear();
            // Interrupt and stop detach the handle before the child is gone.
            let detached = state.process.take().is_none();

            if report.requested || detached || state.stopped {
                debug!(code = ?report.code, "requested termination completed");
                return;
            }

            let err = AppError::Exited {
                code: report.code,
                stderr: report.stderr.clone(),
            };

            if err.is_abnormal_exit() {
                warn!(code = ?report.code, stderr = %report.stderr, "agent process exited abnormally");
                state.terminal_error = Some(err.clone());
            } else {
                info!("agent process exited cleanly; will recreate on next query");
                state.needs_recreation = true;
            }

            if let Some(active) = &state.active {
                active.signal(QuerySignal::Failed(err));
            }
        });
    }
}

impl InboundSink for Router {
    fn control_response(&self, response: ControlResponse) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let sender = shared.lock().pending_control.remove(&response.request_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(response);
            }
            None => debug!(
                request_id = %response.request_id,
                "control_response without pending request"
            ),
        }
    }

    fn first_init(&self, continuation_id: &str) {
        self.with_current(|state| {
            if state.continuation_id.is_empty() {
                info!(continuation_id, "continuation id captured");
                state.continuation_id = continuation_id.to_owned();
            } else if state.continuation_id != continuation_id {
                debug!(
                    kept = %state.continuation_id,
                    announced = continuation_id,
                    "agent announced a different session id; keeping the known one"
                );
            }
        });
    }

    fn event(&self, event: Event) {
        self.with_current(|state| match &state.active {
            Some(active) => active.signal(QuerySignal::Event(event)),
            None => debug!(kind = event.kind(), "dropping event with no active query"),
        });
    }
}
