//! SNS topic publisher.
//!
//! Serializes each event to its JSON wire form and publishes it to a topic,
//! copying `event_type`, `event_id` and `source` into message attributes so
//! the broker can filter without reading the body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{PublishError, Publisher, EVENT_ID_ATTR, EVENT_TYPE_ATTR, SOURCE_ATTR};
use crate::broker::{MessageAttribute, TopicClient};
use crate::event::DomainEvent;

/// Publishes events to a fan-out topic.
///
/// Must be connected before publishing. Failures are returned to the caller
/// with the event attached; nothing is retried here.
pub struct SnsPublisher {
    client: Arc<dyn TopicClient>,
    default_topic_arn: String,
    connected: AtomicBool,
}

impl SnsPublisher {
    pub fn new(client: Arc<dyn TopicClient>, default_topic_arn: impl Into<String>) -> Self {
        Self {
            client,
            default_topic_arn: default_topic_arn.into(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn default_topic_arn(&self) -> &str {
        &self.default_topic_arn
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn message_attributes(event: &DomainEvent) -> [MessageAttribute; 3] {
    [
        MessageAttribute::new(EVENT_TYPE_ATTR, event.event_type()),
        MessageAttribute::new(EVENT_ID_ATTR, event.event_id()),
        MessageAttribute::new(SOURCE_ATTR, event.metadata().source()),
    ]
}

#[async_trait]
impl Publisher for SnsPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        if !self.connected.swap(true, Ordering::SeqCst) {
            info!(topic_arn = %self.default_topic_arn, "SNS publisher connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PublishError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(topic_arn = %self.default_topic_arn, "SNS publisher disconnected");
        }
        Ok(())
    }

    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event_type = %event.event_type(), event_id = %event.event_id())
    )]
    async fn publish(&self, event: &DomainEvent, topic: Option<&str>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected {
                event: Box::new(event.clone()),
            });
        }

        let body = event.to_json().map_err(|source| PublishError::Serialization {
            event: Box::new(event.clone()),
            source,
        })?;

        let topic_arn = topic.unwrap_or(&self.default_topic_arn);
        let message_id = self
            .client
            .publish(topic_arn, &body, &message_attributes(event))
            .await
            .map_err(|source| PublishError::Transport {
                event: Box::new(event.clone()),
                source,
            })?;

        debug!(
            topic_arn = %topic_arn,
            message_id = %message_id,
            "Published event to SNS"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, LocalBroker, QueueClient, ReceiveRequest, PROTOCOL_SQS};
    use std::collections::HashMap;

    fn event() -> DomainEvent {
        DomainEvent::with_metadata(
            "auth.user.registered",
            crate::event::EventMetadata::new("auth-service"),
            serde_json::json!({"user_id": "u1"}),
        )
    }

    async fn subscribed_queue(broker: &LocalBroker, topic_arn: &str) -> String {
        let url = broker
            .create_queue("sink", &HashMap::new())
            .await
            .unwrap();
        let arn = broker.get_queue_arn(&url).await.unwrap();
        broker.subscribe(topic_arn, PROTOCOL_SQS, &arn).await.unwrap();
        url
    }

    #[tokio::test]
    async fn test_publish_requires_connect() {
        let broker = Arc::new(LocalBroker::default());
        let topic = broker.create_topic("auth-events").await.unwrap();
        let publisher = SnsPublisher::new(broker.clone(), topic);

        let err = publisher.publish(&event(), None).await.unwrap_err();

        assert!(matches!(err, PublishError::NotConnected { .. }));
        assert_eq!(err.event().map(|e| e.event_type()), Some("auth.user.registered"));
        assert_eq!(broker.call_counts().await.publish, 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let broker = Arc::new(LocalBroker::default());
        let publisher = SnsPublisher::new(broker, "arn:aws:sns:us-east-1:000000000000:t");
        publisher.connect().await.unwrap();
        publisher.connect().await.unwrap();
        assert!(publisher.is_connected());
        publisher.disconnect().await.unwrap();
        assert!(!publisher.is_connected());
    }

    #[tokio::test]
    async fn test_publish_sends_body_and_attributes() {
        let broker = Arc::new(LocalBroker::default());
        let topic = broker.create_topic("auth-events").await.unwrap();
        let queue = subscribed_queue(&broker, &topic).await;
        let publisher = SnsPublisher::new(broker.clone(), topic);
        publisher.connect().await.unwrap();

        let sent = event();
        publisher.publish(&sent, None).await.unwrap();

        let received = broker
            .receive_messages(
                &queue,
                &ReceiveRequest {
                    max_messages: 1,
                    wait_time_secs: 0,
                    visibility_timeout_secs: 30,
                },
            )
            .await
            .unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&received[0].body).unwrap();
        let attributes = &envelope["MessageAttributes"];
        assert_eq!(attributes["event_type"]["Value"], "auth.user.registered");
        assert_eq!(attributes["event_id"]["Value"], sent.event_id());
        assert_eq!(attributes["source"]["Value"], "auth-service");

        let inner = envelope["Message"].as_str().unwrap();
        assert_eq!(DomainEvent::<serde_json::Value>::from_json(inner).unwrap(), sent);
    }

    #[tokio::test]
    async fn test_explicit_topic_overrides_default() {
        let broker = Arc::new(LocalBroker::default());
        let default_topic = broker.create_topic("default").await.unwrap();
        let other_topic = broker.create_topic("other").await.unwrap();
        let queue = subscribed_queue(&broker, &other_topic).await;
        let publisher = SnsPublisher::new(broker.clone(), default_topic);
        publisher.connect().await.unwrap();

        publisher.publish(&event(), Some(&other_topic)).await.unwrap();

        assert_eq!(broker.queue_depth(&queue).await, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_carries_event() {
        let broker = Arc::new(LocalBroker::default());
        let topic = broker.create_topic("auth-events").await.unwrap();
        let publisher = SnsPublisher::new(broker.clone(), topic);
        publisher.connect().await.unwrap();
        broker.set_fail_on_publish(true);

        let sent = event();
        let err = publisher.publish(&sent, None).await.unwrap_err();

        match err {
            PublishError::Transport { event, source } => {
                assert_eq!(event.event_id(), sent.event_id());
                assert!(matches!(source, BrokerError::Service(_)));
            }
            other => panic!("Expected transport error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_is_transport_error() {
        let broker = Arc::new(LocalBroker::default());
        let publisher = SnsPublisher::new(broker, "arn:aws:sns:us-east-1:000000000000:missing");
        publisher.connect().await.unwrap();

        let err = publisher.publish(&event(), None).await.unwrap_err();
        assert!(matches!(
            err,
            PublishError::Transport {
                source: BrokerError::NotFound(_),
                ..
            }
        ));
    }
}
