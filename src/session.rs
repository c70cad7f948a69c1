//! Session reuse policy.
//!
//! A [`SessionSlot`] holds at most one [`Engine`] and decides, per request,
//! whether that engine can serve the given configuration unchanged. When the
//! [spawn signature](crate::config::SpawnSignature) differs, the old engine
//! is stopped and a new one is built that resumes the same conversation.
//!
//! Replacement only happens between queries. The slot never interrupts a
//! running query on the caller's behalf.

use std::collections::HashMap;

use tracing::info;

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineStatus};
use crate::{AppError, Result};

/// Holder of one conversation's engine.
#[derive(Debug, Default)]
pub struct SessionSlot {
    engine: Option<Engine>,
    last_continuation: String,
}

impl SessionSlot {
    /// Empty slot; the first [`acquire`](Self::acquire) spawns.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty slot that resumes `continuation_id` on its first spawn.
    #[must_use]
    pub fn resuming(continuation_id: impl Into<String>) -> Self {
        Self {
            engine: None,
            last_continuation: continuation_id.into(),
        }
    }

    /// Engine able to serve `config`, reusing the current one when possible.
    ///
    /// The current engine is reused when its spawn signature matches and it
    /// has not been stopped. Otherwise it is stopped and replaced. The
    /// replacement resumes the last known continuation id unless `config`
    /// asks for a fresh session.
    ///
    /// # Errors
    ///
    /// - [`AppError::Usage`] if replacement is needed while a query is active.
    /// - [`AppError::Spawn`] if the new engine cannot start.
    pub async fn acquire(&mut self, config: EngineConfig) -> Result<&Engine> {
        let reusable = self.engine.as_ref().is_some_and(|engine| {
            engine.status() != EngineStatus::Stopped
                && engine.config().spawn_signature() == config.spawn_signature()
        });

        if !reusable {
            if let Some(old) = self.engine.take() {
                if old.is_query_active() {
                    self.engine = Some(old);
                    return Err(AppError::Usage(
                        "cannot replace the engine while a query is in progress".into(),
                    ));
                }
                self.retire(old).await;
            }

            let seed = if config.requests_fresh_session() {
                String::new()
            } else {
                self.last_continuation.clone()
            };
            info!(
                binary = %config.binary,
                resume = !seed.is_empty(),
                "building engine for new configuration"
            );
            self.engine = Some(Engine::spawn_resuming(config, seed)?);
        }

        self.engine
            .as_ref()
            .ok_or_else(|| AppError::Closed("session slot is empty".into()))
    }

    /// The current engine, if one has been built.
    #[must_use]
    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// Latest known continuation id; empty if none was ever captured.
    #[must_use]
    pub fn continuation_id(&self) -> String {
        self.engine
            .as_ref()
            .map(Engine::continuation_id)
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.last_continuation.clone())
    }

    /// Stop the current engine, keeping its continuation id for later.
    pub async fn shutdown(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.retire(engine).await;
        }
    }

    async fn retire(&mut self, engine: Engine) {
        let id = engine.continuation_id();
        if !id.is_empty() {
            self.last_continuation = id;
        }
        engine.stop().await;
    }
}

/// Independent session slots keyed by conversation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: HashMap<String, SessionSlot>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for conversation `key`, created or replaced as needed.
    ///
    /// # Errors
    ///
    /// Same as [`SessionSlot::acquire`].
    pub async fn acquire(&mut self, key: &str, config: EngineConfig) -> Result<&Engine> {
        self.slots
            .entry(key.to_owned())
            .or_default()
            .acquire(config)
            .await
    }

    /// The engine for `key`, if one exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Engine> {
        self.slots.get(key).and_then(SessionSlot::engine)
    }

    /// Continuation id known for `key`.
    #[must_use]
    pub fn continuation_id(&self, key: &str) -> Option<String> {
        self.slots.get(key).map(SessionSlot::continuation_id)
    }

    /// Number of conversations tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no conversation is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stop and forget conversation `key`, returning its continuation id.
    pub async fn remove(&mut self, key: &str) -> Option<String> {
        let mut slot = self.slots.remove(key)?;
        slot.shutdown().await;
        Some(slot.continuation_id())
    }

    /// Stop every engine.
    pub async fn shutdown_all(&mut self) {
        for slot in self.slots.values_mut() {
            slot.shutdown().await;
        }
    }
}
