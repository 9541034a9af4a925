//! Broker clients.
//!
//! The publisher, subscriber and provisioner talk to the message broker
//! through two narrow traits: [`TopicClient`] for fan-out topics (SNS) and
//! [`QueueClient`] for durable queues (SQS). Two implementations exist:
//!
//! - [`LocalBroker`]: in-memory topics and queues with SNS-style fan-out and
//!   SQS visibility timeouts, used in tests and local development.
//! - `AwsBroker` (feature `sns-sqs`): AWS SDK clients, also usable against
//!   LocalStack.

#[cfg(feature = "sns-sqs")]
pub mod aws;
pub mod local;

use std::collections::HashMap;

use async_trait::async_trait;

#[cfg(feature = "sns-sqs")]
pub use aws::AwsBroker;
pub use local::LocalBroker;

/// Queue attribute holding the queue ARN.
pub const ATTR_QUEUE_ARN: &str = "QueueArn";
/// Queue attribute holding the retention period in seconds.
pub const ATTR_MESSAGE_RETENTION_PERIOD: &str = "MessageRetentionPeriod";
/// Queue attribute holding the default visibility timeout in seconds.
pub const ATTR_VISIBILITY_TIMEOUT: &str = "VisibilityTimeout";
/// Queue attribute holding the access policy document.
pub const ATTR_POLICY: &str = "Policy";
/// Topic attribute holding the topic ARN.
pub const ATTR_TOPIC_ARN: &str = "TopicArn";

/// Subscription protocol for queue endpoints.
pub const PROTOCOL_SQS: &str = "sqs";

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The named topic or queue does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other broker or transport failure.
    #[error("Broker error: {0}")]
    Service(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// A string-typed message attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttribute {
    pub name: String,
    pub value: String,
}

impl MessageAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An existing topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSubscription {
    pub subscription_arn: String,
    pub protocol: String,
    pub endpoint: String,
}

/// Parameters for a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: i32,
    pub wait_time_secs: i32,
    pub visibility_timeout_secs: i32,
}

/// A message leased from a queue.
///
/// The lease lasts until the visibility timeout expires or the message is
/// deleted with its receipt handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// Fan-out topic operations.
#[async_trait]
pub trait TopicClient: Send + Sync {
    /// Attributes of the topic with the given ARN; `NotFound` if absent.
    async fn get_topic_attributes(&self, topic_arn: &str) -> Result<HashMap<String, String>>;

    /// Create a topic and return its ARN.
    async fn create_topic(&self, name: &str) -> Result<String>;

    /// Subscriptions currently attached to a topic.
    async fn list_subscriptions(&self, topic_arn: &str) -> Result<Vec<TopicSubscription>>;

    /// Attach an endpoint to a topic and return the subscription ARN.
    async fn subscribe(&self, topic_arn: &str, protocol: &str, endpoint: &str) -> Result<String>;

    /// Publish a message to every subscriber of a topic. Returns the message id.
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        attributes: &[MessageAttribute],
    ) -> Result<String>;
}

/// Durable queue operations.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// URL of the named queue; `NotFound` if absent.
    async fn get_queue_url(&self, name: &str) -> Result<String>;

    /// Create a queue with the given attributes and return its URL.
    async fn create_queue(&self, name: &str, attributes: &HashMap<String, String>)
        -> Result<String>;

    /// ARN of the queue at `queue_url`.
    async fn get_queue_arn(&self, queue_url: &str) -> Result<String>;

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<()>;

    /// Send a message directly to a queue. Returns the message id.
    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String>;

    /// Lease up to `max_messages` messages, waiting up to `wait_time_secs`
    /// for at least one to arrive.
    async fn receive_messages(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Delete a leased message. Stale receipt handles are an error.
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;
}
