//! SQS queue subscriber.
//!
//! A single background task long-polls one queue and fans each message out
//! to the registered handlers.
//!
//! Delivery is at-least-once: a message is deleted only after `dispatch`
//! returns, so a crash in between leaves it to reappear after the visibility
//! timeout. Handler failures do not withhold the delete; they are logged and
//! the message is gone. Messages that cannot be parsed into an event are
//! deleted straight away so they never block the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::{cancelled, is_cancelled, ConsumerTask, Subscriber, SubscriptionError};
use crate::broker::{QueueClient, ReceiveRequest, ReceivedMessage};
use crate::config::SubscriberConfig;
use crate::event::{DomainEvent, EventError};
use crate::handlers::{DispatchOutcome, EventHandler, HandlerRegistry};

/// Field holding the original message inside an SNS notification.
const NOTIFICATION_MESSAGE_FIELD: &str = "Message";

/// Receive loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Messages per receive call (1-10).
    pub max_messages: i32,
    /// Long-poll wait per receive call (0-20 s).
    pub wait_time_secs: i32,
    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout_secs: i32,
    /// Delay after an empty or failed receive.
    pub poll_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        SubscriberConfig::default().poll_settings()
    }
}

impl PollSettings {
    fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.max_messages,
            wait_time_secs: self.wait_time_secs,
            visibility_timeout_secs: self.visibility_timeout_secs,
        }
    }
}

/// Parse a queue message body into an event.
///
/// Accepts either the event JSON itself or an SNS notification whose
/// `Message` field holds it. Only one level of envelope is unwrapped.
pub fn parse_message_body(body: &str) -> Result<DomainEvent, EventError> {
    let value: Value = serde_json::from_str(body).map_err(EventError::Decode)?;

    let value = match value.get(NOTIFICATION_MESSAGE_FIELD) {
        Some(Value::String(inner)) => serde_json::from_str(inner).map_err(EventError::Decode)?,
        Some(inner) => inner.clone(),
        None => value,
    };

    DomainEvent::from_value(value)
}

/// Everything the poll task needs, shared with the subscriber.
#[derive(Clone)]
struct Poller {
    client: Arc<dyn QueueClient>,
    queue_url: String,
    settings: PollSettings,
    handlers: HandlerRegistry,
}

impl Poller {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        info!(queue_url = %self.queue_url, "Starting SQS consumer");
        let request = self.settings.receive_request();

        loop {
            if is_cancelled(&cancel) {
                break;
            }

            let received = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                result = self.client.receive_messages(&self.queue_url, &request) => result,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    error!(queue_url = %self.queue_url, error = %e, "Failed to receive messages");
                    if self.idle(&mut cancel).await {
                        break;
                    }
                    continue;
                }
            };

            if messages.is_empty() {
                if self.idle(&mut cancel).await {
                    break;
                }
                continue;
            }

            for message in &messages {
                // A message already started always finishes; the rest of the
                // batch reappears after the visibility timeout.
                if is_cancelled(&cancel) {
                    debug!(queue_url = %self.queue_url, "Stop requested mid-batch");
                    break;
                }
                self.process(message).await;
            }
        }

        info!(queue_url = %self.queue_url, "SQS consumer stopped");
    }

    /// Sleep for the poll interval. Returns true if cancelled meanwhile.
    async fn idle(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = cancelled(cancel) => true,
            _ = tokio::time::sleep(self.settings.poll_interval) => false,
        }
    }

    async fn receive_batch(&self) -> Result<Vec<ReceivedMessage>, SubscriptionError> {
        self.client
            .receive_messages(&self.queue_url, &self.settings.receive_request())
            .await
            .map_err(|e| {
                SubscriptionError::for_target(
                    format!("Failed to receive messages: {}", e),
                    &self.queue_url,
                )
            })
    }

    async fn process(&self, message: &ReceivedMessage) {
        match parse_message_body(&message.body) {
            Ok(event) => {
                debug!(
                    message_id = %message.message_id,
                    event_type = event.event_type(),
                    event_id = event.event_id(),
                    "Received event"
                );
                let outcome = self.handlers.dispatch(&event).await;
                if !outcome.all_succeeded() {
                    warn!(
                        event_type = event.event_type(),
                        event_id = event.event_id(),
                        failed = outcome.failed,
                        "Handlers failed, message deleted without redelivery"
                    );
                }
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id,
                    error = %e,
                    "Discarding poison message"
                );
            }
        }

        self.delete(message).await;
    }

    async fn delete(&self, message: &ReceivedMessage) {
        if let Err(e) = self
            .client
            .delete_message(&self.queue_url, &message.receipt_handle)
            .await
        {
            error!(
                message_id = %message.message_id,
                error = %e,
                "Failed to delete message, it will be redelivered"
            );
        }
    }
}

/// Subscriber bound to one SQS queue.
pub struct SqsSubscriber {
    poller: Poller,
    connected: AtomicBool,
    running: Arc<AtomicBool>,
    consumer: Mutex<Option<ConsumerTask>>,
}

impl SqsSubscriber {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue_url: impl Into<String>,
        settings: PollSettings,
    ) -> Self {
        Self {
            poller: Poller {
                client,
                queue_url: queue_url.into(),
                settings,
                handlers: HandlerRegistry::new(),
            },
            connected: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            consumer: Mutex::new(None),
        }
    }

    pub fn queue_url(&self) -> &str {
        &self.poller.queue_url
    }

    pub fn settings(&self) -> &PollSettings {
        &self.poller.settings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Receive and process a single batch on the caller's task.
    ///
    /// Returns the number of messages handled. Intended for tools and tests
    /// that drive the queue without the background loop.
    pub async fn poll_once(&self) -> Result<usize, SubscriptionError> {
        let messages = self.poller.receive_batch().await?;
        for message in &messages {
            self.poller.process(message).await;
        }
        Ok(messages.len())
    }
}

#[async_trait]
impl Subscriber for SqsSubscriber {
    async fn connect(&self) -> Result<(), SubscriptionError> {
        let queue_url = &self.poller.queue_url;
        let queue_arn = self
            .poller
            .client
            .get_queue_arn(queue_url)
            .await
            .map_err(|e| {
                SubscriptionError::for_target(format!("Failed to connect to queue: {}", e), queue_url)
            })?;

        self.connected.store(true, Ordering::SeqCst);
        info!(queue_url = %queue_url, queue_arn = %queue_arn, "SQS subscriber connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SubscriptionError> {
        self.stop().await?;
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(queue_url = %self.poller.queue_url, "SQS subscriber disconnected");
        }
        Ok(())
    }

    async fn start(&self, topics: Option<&[String]>) -> Result<(), SubscriptionError> {
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            warn!(queue_url = %self.poller.queue_url, "SQS subscriber already running");
            return Ok(());
        }
        if !self.is_connected() {
            self.connect().await?;
        }
        if let Some(topics) = topics {
            debug!(topics = ?topics, "Topics are bound at provisioning time; consuming queue");
        }

        let poller = self.poller.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        *consumer = Some(ConsumerTask::spawn(move |cancel| async move {
            poller.run(cancel).await;
            running.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    async fn stop(&self) -> Result<(), SubscriptionError> {
        let task = self.consumer.lock().await.take();
        if let Some(task) = task {
            task.stop().await.map_err(|e| {
                SubscriptionError::for_target(
                    format!("Consumer task failed: {}", e),
                    &self.poller.queue_url,
                )
            })?;
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.poller.handlers.register(handler).await;
    }

    async fn unregister_handler(&self, handler: &Arc<dyn EventHandler>) -> bool {
        self.poller.handlers.unregister(handler).await
    }

    async fn dispatch(&self, event: &DomainEvent) -> DispatchOutcome {
        self.poller.handlers.dispatch(event).await
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
