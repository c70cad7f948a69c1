//! Interrupt, recreation and control requests.
//!
//! [`Engine::interrupt`] stops the active query immediately: the process is
//! terminated, the query ends with [`AppError::Interrupted`], and the next
//! query spawns a replacement that resumes the same conversation.
//!
//! [`Engine::send_control`] is the acknowledged path. It writes a
//! `control_request` and waits for the `control_response` carrying the same
//! request id.

use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Engine, QuerySignal};
use crate::protocol::messages::{control_request, ControlResponse};
use crate::{AppError, Result};

/// Control subtype asking the agent to stop its current turn.
pub const INTERRUPT_SUBTYPE: &str = "interrupt";

impl Engine {
    /// Cancel the active query and schedule process recreation.
    ///
    /// Safe to call from any task while a [`QueryStream`](super::QueryStream)
    /// is being consumed. With no active query it only schedules the
    /// recreation. Does nothing once the engine is stopped.
    pub fn interrupt(&self) {
        let stale = {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.interrupted = true;
            state.needs_recreation = true;
            if let Some(active) = &state.active {
                active.signal(QuerySignal::Failed(AppError::Interrupted));
            }
            state.pending_control.clear();
            state.process.take()
        };

        match stale {
            Some(handle) => info!(pid = handle.info.pid, "interrupt: terminating agent process"),
            None => debug!("interrupt: no live process"),
        }
    }

    /// Schedule a fresh process for the next query.
    ///
    /// Clears a recorded abnormal exit. The conversation continues through
    /// the known continuation id.
    ///
    /// # Errors
    ///
    /// - [`AppError::Closed`] once the engine is stopped.
    /// - [`AppError::Usage`] while a query is active.
    /// - The recorded [`AppError::Spawn`] error; a binary that failed to start
    ///   is not retried.
    pub fn recreate(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.stopped {
            return Err(AppError::Closed("engine stopped".into()));
        }
        if state.active.is_some() {
            return Err(AppError::Usage(
                "cannot recreate while a query is in progress".into(),
            ));
        }
        if let Some(err @ AppError::Spawn(_)) = &state.terminal_error {
            return Err(err.clone());
        }
        state.needs_recreation = true;
        debug!("recreation scheduled");
        Ok(())
    }

    /// Send a control request and wait for its response.
    ///
    /// The response is returned whether the agent reports success or error.
    ///
    /// # Errors
    ///
    /// - [`AppError::Closed`] if there is no live process, or it goes away
    ///   before answering.
    /// - [`AppError::Io`] if the request cannot be written.
    /// - [`AppError::Timeout`] if no response arrives in time.
    pub async fn send_control(&self, subtype: &str) -> Result<ControlResponse> {
        let (tx, rx) = oneshot::channel();

        let (request_id, outbound, wait) = {
            let mut state = self.shared.lock();
            if state.stopped {
                return Err(AppError::Closed("engine stopped".into()));
            }
            let Some(process) = &state.process else {
                return Err(AppError::Closed("no live agent process".into()));
            };
            let outbound = process.outbound.clone();

            state.next_control_id += 1;
            let request_id = next_request_id(state.next_control_id);
            state.pending_control.insert(request_id.clone(), tx);
            (request_id, outbound, state.config.control_timeout())
        };

        debug!(%request_id, subtype, "sending control request");
        if outbound
            .send(control_request(&request_id, subtype))
            .await
            .is_err()
        {
            self.forget_control(&request_id);
            return Err(AppError::Io("agent stdin closed".into()));
        }

        self.await_control(&request_id, rx, wait).await
    }

    /// Ask the agent to stop its current turn without killing the process.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::send_control`], plus [`AppError::Protocol`] when the
    /// agent answers with an error.
    pub async fn request_interrupt(&self) -> Result<()> {
        let response = self.send_control(INTERRUPT_SUBTYPE).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(AppError::Protocol(format!(
                "interrupt rejected: {}",
                response.error.unwrap_or_else(|| "no reason given".into())
            )))
        }
    }

    async fn await_control(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<ControlResponse>,
        wait: Duration,
    ) -> Result<ControlResponse> {
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(AppError::Closed(format!(
                "control request {request_id} abandoned: agent process gone"
            ))),
            Err(_elapsed) => {
                self.forget_control(request_id);
                warn!(request_id, ?wait, "control request timed out");
                Err(AppError::Timeout(format!(
                    "no control_response for {request_id} within {wait:?}"
                )))
            }
        }
    }

    fn forget_control(&self, request_id: &str) {
        self.shared.lock().pending_control.remove(request_id);
    }
}

/// `req_<counter>_<8 hex chars>`, unique per engine and across engines.
fn next_request_id(counter: u64) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("req_{counter}_{suffix}")
}
