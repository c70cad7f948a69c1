//! Query state machine.
//!
//! At most one query runs per engine. [`Engine::query`] registers the query
//! as active, writes the user turn, and hands back a [`QueryStream`] that
//! yields events in arrival order until the terminal `result`.
//!
//! The stream ends with an error when the query is interrupted, the process
//! exits, or the engine stops. Finishing or dropping the stream releases the
//! active slot and clears the interrupted flag.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ActiveQuery, Engine, QuerySignal, Shared};
use crate::protocol::messages::{user_turn, Event, ResultEvent};
use crate::{AppError, Result};

/// Everything a completed query produced.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    /// Events before the result, in arrival order.
    pub events: Vec<Event>,
    /// The terminal result.
    pub result: ResultEvent,
}

impl QueryOutcome {
    /// Text of every assistant message, concatenated.
    #[must_use]
    pub fn assistant_text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Assistant(msg) => Some(msg.message.text()),
                _ => None,
            })
            .collect()
    }
}

/// Pull-based view of one query's events.
///
/// Items are `Ok(event)` up to and including the terminal
/// [`Event::Result`], or a single `Err` when the query fails. After either,
/// the stream yields `None`.
#[derive(Debug)]
pub struct QueryStream {
    shared: Arc<Shared>,
    id: u64,
    rx: mpsc::UnboundedReceiver<QuerySignal>,
    done: bool,
}

impl QueryStream {
    fn new(shared: Arc<Shared>, id: u64, rx: mpsc::UnboundedReceiver<QuerySignal>) -> Self {
        Self {
            shared,
            id,
            rx,
            done: false,
        }
    }

    /// Drain the stream into a [`QueryOutcome`].
    ///
    /// # Errors
    ///
    /// Returns the error that ended the query, or [`AppError::Closed`] if
    /// the stream ended without a result.
    pub async fn collect_result(mut self) -> Result<QueryOutcome> {
        let mut events = Vec::new();
        while let Some(item) = self.next().await {
            match item? {
                Event::Result(result) => return Ok(QueryOutcome { events, result }),
                event => events.push(event),
            }
        }
        Err(AppError::Closed("query ended without a result".into()))
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.rx.close();

        let mut state = self.shared.lock();
        if state.active.as_ref().is_some_and(|active| active.id == self.id) {
            state.active = None;
        }
        state.interrupted = false;
        debug!(query = self.id, "query finished");
    }
}

impl Stream for QueryStream {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(QuerySignal::Event(event)) => {
                if event.is_terminal() {
                    self.finish();
                }
                Ok(event)
            }
            Some(QuerySignal::Failed(err)) => {
                self.finish();
                Err(err)
            }
            None => {
                self.finish();
                Err(AppError::Closed("query channel closed".into()))
            }
        };
        Poll::Ready(Some(item))
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl Engine {
    /// Start a query with `prompt`.
    ///
    /// Recreates the process first if an interrupt or clean exit left the
    /// engine pending recreation.
    ///
    /// # Errors
    ///
    /// - [`AppError::Usage`] if another query is still active.
    /// - The recorded terminal error, e.g. [`AppError::Exited`].
    /// - [`AppError::Spawn`] if recreation fails.
    /// - [`AppError::Closed`] once the engine is stopped.
    pub async fn query(&self, prompt: &str) -> Result<QueryStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        let (id, outbound, payload) = {
            let mut state = self.shared.lock();

            if state.stopped {
                return Err(AppError::Closed("engine stopped".into()));
            }
            if state.active.is_some() {
                return Err(AppError::Usage("a query is already in progress".into()));
            }
            if let Some(err @ AppError::Spawn(_)) = &state.terminal_error {
                return Err(err.clone());
            }
            if state.needs_recreation {
                Self::respawn_locked(&self.shared, &mut state)?;
            }
            if let Some(err) = &state.terminal_error {
                return Err(err.clone());
            }
            let Some(process) = &state.process else {
                return Err(AppError::Closed("no live agent process".into()));
            };
            let outbound = process.outbound.clone();

            state.next_query_id += 1;
            let id = state.next_query_id;
            state.active = Some(ActiveQuery { id, tx });

            (id, outbound, user_turn(prompt, &state.continuation_id))
        };

        let stream = QueryStream::new(Arc::clone(&self.shared), id, rx);
        info!(query = id, prompt_len = prompt.len(), "query started");

        if outbound.send(payload).await.is_err() {
            return Err(AppError::Io("agent stdin closed".into()));
        }
        Ok(stream)
    }

    /// Run a query to completion.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::query`] and [`QueryStream::collect_result`].
    pub async fn query_once(&self, prompt: &str) -> Result<QueryOutcome> {
        self.query(prompt).await?.collect_result().await
    }
}
