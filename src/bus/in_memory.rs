//! In-memory publisher and subscriber.
//!
//! Neither talks to a broker. The publisher keeps an ordered log of
//! everything published and invokes per-type callbacks inline; the
//! subscriber drains an unbounded channel fed by `inject_event`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{
    cancelled, ConsumerTask, PublishError, Publisher, Subscriber, SubscriptionError,
};
use crate::broker::BrokerError;
use crate::event::DomainEvent;
use crate::handlers::{DispatchOutcome, EventHandler, HandlerError, HandlerRegistry};

/// Callback invoked for each published event of a subscribed type.
pub type EventCallback =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wrap an async closure as an [`EventCallback`].
pub fn event_callback<F, Fut>(callback: F) -> EventCallback
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |event: DomainEvent| callback(event).boxed())
}

// ============================================================================
// Publisher
// ============================================================================

/// Publisher that records events in memory.
///
/// Works without `connect`. Callbacks run in registration order during
/// `publish`; a failing callback is logged and does not fail the publish.
#[derive(Default)]
pub struct InMemoryPublisher {
    events: RwLock<Vec<DomainEvent>>,
    callbacks: RwLock<HashMap<String, Vec<EventCallback>>>,
    connected: AtomicBool,
    fail_on_publish: AtomicBool,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `callback` for every event of `event_type` published from now on.
    pub async fn subscribe(&self, event_type: impl Into<String>, callback: EventCallback) {
        self.callbacks
            .write()
            .await
            .entry(event_type.into())
            .or_default()
            .push(callback);
    }

    /// Remove a callback by identity. Returns whether it was registered.
    pub async fn unsubscribe(&self, event_type: &str, callback: &EventCallback) -> bool {
        let mut callbacks = self.callbacks.write().await;
        let Some(registered) = callbacks.get_mut(event_type) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|c| !Arc::ptr_eq(c, callback));
        registered.len() != before
    }

    /// Everything published so far, in order.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_by_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Forget recorded events. Callbacks stay registered.
    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Make every publish fail with a transport error until reset.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.fail_on_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, event: &DomainEvent, topic: Option<&str>) -> Result<(), PublishError> {
        if self.fail_on_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Transport {
                event: Box::new(event.clone()),
                source: BrokerError::Service("In-memory publish failure".to_string()),
            });
        }

        self.events.write().await.push(event.clone());
        debug!(
            event_type = event.event_type(),
            event_id = event.event_id(),
            topic = ?topic,
            "Recorded event"
        );

        let callbacks = self
            .callbacks
            .read()
            .await
            .get(event.event_type())
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            if let Err(e) = callback(event.clone()).await {
                error!(
                    event_type = event.event_type(),
                    event_id = event.event_id(),
                    error = %e,
                    "Event callback failed"
                );
            }
        }

        Ok(())
    }
}

// ============================================================================
// Subscriber
// ============================================================================

/// Subscriber fed directly by the test or embedding code.
///
/// `inject_event` queues an event for the background task started by
/// `start`; `process_event` dispatches immediately on the caller's task.
pub struct InMemorySubscriber {
    handlers: HandlerRegistry,
    sender: mpsc::UnboundedSender<DomainEvent>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DomainEvent>>>,
    processed: Arc<RwLock<Vec<DomainEvent>>>,
    connected: AtomicBool,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<ConsumerTask>>,
}

impl Default for InMemorySubscriber {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            handlers: HandlerRegistry::new(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            processed: Arc::new(RwLock::new(Vec::new())),
            connected: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
        }
    }
}

impl InMemorySubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event for the background consumer.
    ///
    /// Events injected while stopped are processed after the next `start`.
    pub fn inject_event(&self, event: DomainEvent) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.sender.send(event);
    }

    /// Record and dispatch an event on the caller's task.
    pub async fn process_event(&self, event: DomainEvent) -> DispatchOutcome {
        record_and_dispatch(&self.handlers, &self.processed, event).await
    }

    /// Events processed so far, in order.
    pub async fn processed_events(&self) -> Vec<DomainEvent> {
        self.processed.read().await.clone()
    }

    /// Forget processed events. Handlers stay registered.
    pub async fn clear(&self) {
        self.processed.write().await.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn record_and_dispatch(
    handlers: &HandlerRegistry,
    processed: &RwLock<Vec<DomainEvent>>,
    event: DomainEvent,
) -> DispatchOutcome {
    processed.write().await.push(event.clone());
    handlers.dispatch(&event).await
}

#[async_trait]
impl Subscriber for InMemorySubscriber {
    async fn connect(&self) -> Result<(), SubscriptionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SubscriptionError> {
        self.stop().await?;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _topics: Option<&[String]>) -> Result<(), SubscriptionError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            warn!("In-memory subscriber already running");
            return Ok(());
        }
        if !self.is_connected() {
            self.connect().await?;
        }

        let handlers = self.handlers.clone();
        let receiver = self.receiver.clone();
        let processed = self.processed.clone();
        let running = self.running.clone();

        running.store(true, Ordering::SeqCst);
        *consumer = Some(ConsumerTask::spawn(move |mut cancel| async move {
            let mut receiver = receiver.lock().await;
            loop {
                tokio::select! {
                    _ = cancelled(&mut cancel) => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            record_and_dispatch(&handlers, &processed, event).await;
                        }
                        None => break,
                    },
                }
            }
            running.store(false, Ordering::SeqCst);
        }));

        info!("In-memory subscriber started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SubscriptionError> {
        let task = self.consumer.lock().await.take();
        if let Some(task) = task {
            task.stop()
                .await
                .map_err(|e| SubscriptionError::new(format!("Consumer task failed: {}", e)))?;
            self.running.store(false, Ordering::SeqCst);
            info!("In-memory subscriber stopped");
        }
        Ok(())
    }

    async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.register(handler).await;
    }

    async fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        self.handlers.unregister(handler).await
    }

    async fn dispatch(&self, event: &DomainEvent) -> DispatchOutcome {
        self.handlers.dispatch(event).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
