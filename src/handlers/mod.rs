//! Event handler abstraction.
//!
//! Handlers declare which event types they accept via [`EventHandler::can_handle`]
//! and process them in [`EventHandler::handle`]. Subscribers keep an ordered
//! [`HandlerRegistry`] and fan each event out to every matching handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::event::{DomainEvent, EventError};

/// Errors raised by event handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Payload error: {0}")]
    Payload(#[from] EventError),

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handlers failed: {}", failed.join(", "))]
    Composite { failed: Vec<String> },

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Processes domain events of the types it declares.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Whether this handler accepts events of `event_type`.
    ///
    /// Must be pure: it is called on every dispatch.
    fn can_handle(&self, event_type: &str) -> bool;

    /// Handle a single event.
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

/// Run `handler`, turning a panic into [`HandlerError::Panicked`].
///
/// Keeps one broken handler from unwinding the consumer task.
async fn handle_guarded(
    handler: &Arc<dyn EventHandler>,
    event: &DomainEvent,
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Composite
// ============================================================================

/// Runs every matching member handler, in insertion order.
///
/// A failing member does not stop the rest. After all members ran, the
/// composite reports the names of those that failed.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Remove a handler by identity. Returns whether it was present.
    pub fn remove_handler(&mut self, handler: &Arc<dyn EventHandler>) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        self.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl EventHandler for CompositeEventHandler {
    fn name(&self) -> &str {
        "composite"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        self.handlers.iter().any(|h| h.can_handle(event_type))
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let mut failed = Vec::new();

        for handler in self
            .handlers
            .iter()
            .filter(|h| h.can_handle(event.event_type()))
        {
            if let Err(e) = handle_guarded(handler, event).await {
                error!(
                    handler = handler.name(),
                    event_type = event.event_type(),
                    event_id = event.event_id(),
                    error = %e,
                    "Composite member failed"
                );
                failed.push(handler.name().to_string());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::Composite { failed })
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Result of dispatching one event through a [`HandlerRegistry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers whose `can_handle` accepted the event.
    pub matched: usize,
    /// Matched handlers that returned an error.
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Ordered set of handlers shared by a subscriber and its poll task.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "Registering handler");
        self.handlers.write().await.push(handler);
    }

    /// Remove a handler by identity. Returns whether it was present.
    pub async fn unregister(&self, handler: &Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().await;
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }

    /// Dispatch an event to every matching handler in registration order.
    ///
    /// Handlers run sequentially. Failures are logged and counted, never
    /// propagated, so one failing handler cannot starve the rest. The list
    /// is snapshotted first; handlers registered mid-dispatch apply to the
    /// next event.
    pub async fn dispatch(&self, event: &DomainEvent) -> DispatchOutcome {
        let handlers = self.handlers.read().await.clone();
        let mut outcome = DispatchOutcome::default();

        for handler in handlers
            .iter()
            .filter(|h| h.can_handle(event.event_type()))
        {
            outcome.matched += 1;
            if let Err(e) = handle_guarded(handler, event).await {
                error!(
                    handler = handler.name(),
                    event_type = event.event_type(),
                    event_id = event.event_id(),
                    error = %e,
                    "Handler failed"
                );
                outcome.failed += 1;
            }
        }

        if outcome.matched == 0 {
            debug!(event_type = event.event_type(), "No handler for event");
        }

        outcome
    }
}
