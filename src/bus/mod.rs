//! Event bus: publishers and subscribers.
//!
//! This module contains:
//! - `Publisher` trait: hand events to the broker
//! - `Subscriber` trait: receive events and fan them out to handlers
//! - Implementations: in-memory (tests, local development) and SNS/SQS

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::BrokerError;
use crate::event::{DomainEvent, EventError};
use crate::handlers::{DispatchOutcome, EventHandler};

// Implementation modules
pub mod in_memory;
pub mod sns;
pub mod sqs;

// Re-exports
pub use in_memory::{event_callback, EventCallback, InMemoryPublisher, InMemorySubscriber};
pub use sns::SnsPublisher;
pub use sqs::{parse_message_body, PollSettings, SqsSubscriber};

/// Message attribute carrying the event type.
pub const EVENT_TYPE_ATTR: &str = "event_type";

/// Message attribute carrying the event id.
pub const EVENT_ID_ATTR: &str = "event_id";

/// Message attribute carrying the producing service.
pub const SOURCE_ATTR: &str = "source";

// ============================================================================
// Errors
// ============================================================================

/// Publishing failed. Carries the event so callers can log or retry it.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Publisher not connected, event {} not sent", event.event_id())]
    NotConnected { event: Box<DomainEvent> },

    #[error("Failed to encode {event_type} event {event_id}: {source}")]
    Encode {
        event_type: String,
        event_id: String,
        source: EventError,
    },

    #[error("Failed to serialize event {}: {source}", event.event_id())]
    Serialization {
        event: Box<DomainEvent>,
        source: EventError,
    },

    #[error("Failed to publish {} event {}: {source}", event.event_type(), event.event_id())]
    Transport {
        event: Box<DomainEvent>,
        source: BrokerError,
    },

    #[error("Connection failed: {0}")]
    Connection(String),
}

impl PublishError {
    /// The event that failed to publish, when one was built.
    pub fn event(&self) -> Option<&DomainEvent> {
        match self {
            PublishError::NotConnected { event }
            | PublishError::Serialization { event, .. }
            | PublishError::Transport { event, .. } => Some(&**event),
            PublishError::Encode { .. } | PublishError::Connection(_) => None,
        }
    }
}

/// Establishing or maintaining a subscription failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}{}", target.as_deref().map(|t| format!(" ({})", t)).unwrap_or_default())]
pub struct SubscriptionError {
    pub message: String,
    /// Topic or queue the failure relates to.
    pub target: Option<String>,
}

impl SubscriptionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target: None,
        }
    }

    pub fn for_target(message: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            target: Some(target.into()),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Sends domain events to a topic.
///
/// Callers publish after their local state change commits. A failed publish
/// does not roll anything back; callers log the error and decide whether to
/// continue.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn connect(&self) -> Result<(), PublishError>;

    async fn disconnect(&self) -> Result<(), PublishError>;

    /// Publish one event to `topic`, or to the default topic when `None`.
    async fn publish(&self, event: &DomainEvent, topic: Option<&str>) -> Result<(), PublishError>;

    /// Publish events in order, stopping at the first failure.
    ///
    /// Not atomic: events before the failing one stay published.
    async fn publish_batch(
        &self,
        events: &[DomainEvent],
        topic: Option<&str>,
    ) -> Result<(), PublishError> {
        for event in events {
            self.publish(event, topic).await?;
        }
        Ok(())
    }
}

/// Typed publishing on top of [`Publisher`].
#[async_trait]
pub trait PublisherExt: Publisher {
    /// Convert a typed event to its wire form and publish it.
    async fn publish_event<P>(
        &self,
        event: &DomainEvent<P>,
        topic: Option<&str>,
    ) -> Result<(), PublishError>
    where
        P: Serialize + Sync,
    {
        let untyped = event.to_untyped().map_err(|source| PublishError::Encode {
            event_type: event.event_type().to_string(),
            event_id: event.event_id().to_string(),
            source,
        })?;
        self.publish(&untyped, topic).await
    }

    /// Publish typed events in order, stopping at the first failure.
    async fn publish_events<P>(
        &self,
        events: &[DomainEvent<P>],
        topic: Option<&str>,
    ) -> Result<(), PublishError>
    where
        P: Serialize + Sync,
    {
        for event in events {
            self.publish_event(event, topic).await?;
        }
        Ok(())
    }
}

impl<T: Publisher + ?Sized> PublisherExt for T {}

/// Receives events and dispatches them to registered handlers.
///
/// Lifecycle: `connect`, `start`, then `stop` and `disconnect` at shutdown.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn connect(&self) -> Result<(), SubscriptionError>;

    async fn disconnect(&self) -> Result<(), SubscriptionError>;

    /// Start consuming in the background. Calling it while running is a
    /// logged no-op.
    async fn start(&self, topics: Option<&[String]>) -> Result<(), SubscriptionError>;

    /// Stop consuming and wait for the background task to finish.
    async fn stop(&self) -> Result<(), SubscriptionError>;

    async fn register_handler(&self, handler: Arc<dyn EventHandler>);

    /// Remove a handler by identity. Returns whether it was registered.
    async fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool;

    /// Fan an event out to every matching handler.
    async fn dispatch(&self, event: &DomainEvent) -> DispatchOutcome;

    fn is_running(&self) -> bool;
}

// ============================================================================
// Background consumer task
// ============================================================================

/// Handle to a running consumer task.
pub(crate) struct ConsumerTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsumerTask {
    /// Spawn `consume` with a cancellation receiver.
    pub(crate) fn spawn<F, Fut>(consume: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(consume(cancel_rx));
        Self { cancel, handle }
    }

    /// Signal cancellation and wait for the task to finish.
    pub(crate) async fn stop(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.cancel.send(true);
        self.handle.await
    }
}

/// Whether cancellation has been requested.
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Resolve once cancellation is requested, or the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
