//! Producer and consumer startup.
//!
//! Both sides provision what they touch before using it, so either service
//! may start first against an empty broker.

use std::sync::Arc;

use tracing::info;

use super::{AuthEventPublisher, ServiceError};
use crate::broker::{QueueClient, TopicClient};
use crate::bus::{Publisher, SnsPublisher, SqsSubscriber, Subscriber};
use crate::config::Config;
use crate::handlers::EventHandler;
use crate::provision::{Provisioner, QueueHandle, SubscriptionHandle, TopicHandle};

fn provisioner(
    config: &Config,
    topics: Arc<dyn TopicClient>,
    queues: Arc<dyn QueueClient>,
) -> Provisioner {
    Provisioner::new(
        topics,
        queues,
        config.broker.clone(),
        config.provisioning.clone(),
    )
}

// ============================================================================
// Producer
// ============================================================================

/// A connected publisher bound to the service's topic.
pub struct EventProducer {
    service_name: String,
    topic: TopicHandle,
    publisher: Arc<SnsPublisher>,
}

impl EventProducer {
    /// Ensure the configured topic exists and connect a publisher to it.
    pub async fn start(
        config: &Config,
        topics: Arc<dyn TopicClient>,
        queues: Arc<dyn QueueClient>,
    ) -> Result<Self, ServiceError> {
        let topic = provisioner(config, topics.clone(), queues)
            .ensure_topic(&config.publisher.topic_name)
            .await?;

        let publisher = Arc::new(SnsPublisher::new(topics, topic.arn.clone()));
        publisher.connect().await?;

        info!(
            service = %config.service_name,
            topic = %topic.name,
            "Event producer started"
        );

        Ok(Self {
            service_name: config.service_name.clone(),
            topic,
            publisher,
        })
    }

    pub fn topic(&self) -> &TopicHandle {
        &self.topic
    }

    pub fn publisher(&self) -> Arc<dyn Publisher> {
        self.publisher.clone()
    }

    /// Auth event facade stamping this service's name as `source`.
    pub fn auth_events(&self) -> AuthEventPublisher {
        AuthEventPublisher::new(self.publisher()).with_source(&self.service_name)
    }

    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.publisher.disconnect().await?;
        info!(service = %self.service_name, "Event producer stopped");
        Ok(())
    }
}

// ============================================================================
// Consumer
// ============================================================================

/// A running subscriber on the service's queue.
pub struct EventConsumer {
    service_name: String,
    queue: QueueHandle,
    subscriptions: Vec<SubscriptionHandle>,
    subscriber: Arc<SqsSubscriber>,
}

impl EventConsumer {
    /// Provision the queue and its topic subscriptions, register `handlers`
    /// and start polling.
    pub async fn start(
        config: &Config,
        topics: Arc<dyn TopicClient>,
        queues: Arc<dyn QueueClient>,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> Result<Self, ServiceError> {
        let provisioner = provisioner(config, topics, queues.clone());

        let mut topic_handles = Vec::with_capacity(config.subscriber.topics.len());
        for name in &config.subscriber.topics {
            topic_handles.push(provisioner.ensure_topic(name).await?);
        }
        let (queue, subscriptions) = provisioner
            .ensure_subscriptions(&config.subscriber.queue_name, &topic_handles)
            .await?;

        let subscriber = Arc::new(SqsSubscriber::new(
            queues,
            queue.url.clone(),
            config.subscriber.poll_settings(),
        ));
        for handler in handlers {
            subscriber.register_handler(handler).await;
        }
        subscriber.connect().await?;
        subscriber.start(Some(&config.subscriber.topics)).await?;

        info!(
            service = %config.service_name,
            queue = %queue.name,
            topics = ?config.subscriber.topics,
            "Event consumer started"
        );

        Ok(Self {
            service_name: config.service_name.clone(),
            queue,
            subscriptions,
            subscriber,
        })
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn subscriptions(&self) -> &[SubscriptionHandle] {
        &self.subscriptions
    }

    pub fn subscriber(&self) -> Arc<SqsSubscriber> {
        self.subscriber.clone()
    }

    /// Stop polling, wait for the in-flight message, then disconnect.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.subscriber.stop().await?;
        self.subscriber.disconnect().await?;
        info!(service = %self.service_name, "Event consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::LocalBroker;
    use crate::bus::PublisherExt;
    use crate::event::DomainEvent;
    use crate::handlers::HandlerError;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<DomainEvent>);

    #[async_trait]
    impl EventHandler for Forward {
        fn can_handle(&self, _event_type: &str) -> bool {
            true
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    fn fast_config(service: &str) -> Config {
        let mut config = Config::for_service(service);
        config.subscriber.wait_time_secs = 0;
        config.subscriber.poll_interval_ms = 10;
        config
    }

    #[tokio::test]
    async fn test_producer_provisions_topic() {
        let broker = Arc::new(LocalBroker::default());
        let config = fast_config("auth-service");

        let producer = EventProducer::start(&config, broker.clone(), broker.clone())
            .await
            .unwrap();

        assert_eq!(producer.topic().name, "auth-events");
        assert_eq!(broker.call_counts().await.create_topic, 1);

        // Restart reuses the topic.
        EventProducer::start(&config, broker.clone(), broker.clone())
            .await
            .unwrap();
        assert_eq!(broker.call_counts().await.create_topic, 1);
    }

    #[tokio::test]
    async fn test_producer_rejects_publish_after_shutdown() {
        let broker = Arc::new(LocalBroker::default());
        let producer = EventProducer::start(&fast_config("auth-service"), broker.clone(), broker)
            .await
            .unwrap();

        producer.shutdown().await.unwrap();

        let event = DomainEvent::new("auth.user.registered", serde_json::json!({}));
        let err = producer.publisher().publish_event(&event, None).await.unwrap_err();
        assert!(matches!(err, crate::bus::PublishError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_consumer_receives_producer_events() {
        let broker = Arc::new(LocalBroker::default());
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Consumer first: its provisioning creates the topic too.
        let consumer = EventConsumer::start(
            &fast_config("accounts-service"),
            broker.clone(),
            broker.clone(),
            vec![Arc::new(Forward(tx))],
        )
        .await
        .unwrap();
        assert_eq!(consumer.subscriptions().len(), 1);
        assert!(consumer.subscriber().is_running());

        let producer = EventProducer::start(&fast_config("auth-service"), broker.clone(), broker.clone())
            .await
            .unwrap();
        producer
            .auth_events()
            .publish_password_changed("u1", Some("req-7"))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_type(), "auth.password.changed");
        assert_eq!(received.metadata().source(), "auth-service");
        assert_eq!(received.metadata().correlation_id(), Some("req-7"));

        consumer.shutdown().await.unwrap();
        assert!(!consumer.subscriber().is_running());
        assert!(!consumer.subscriber().is_connected());
    }

    #[tokio::test]
    async fn test_consumer_restart_reuses_subscription() {
        let broker = Arc::new(LocalBroker::default());
        let config = fast_config("accounts-service");

        let first = EventConsumer::start(&config, broker.clone(), broker.clone(), vec![])
            .await
            .unwrap();
        first.shutdown().await.unwrap();

        let second = EventConsumer::start(&config, broker.clone(), broker.clone(), vec![])
            .await
            .unwrap();
        second.shutdown().await.unwrap();

        assert_eq!(first.queue(), second.queue());
        assert!(first.subscriptions()[0].created);
        assert!(!second.subscriptions()[0].created);
        assert_eq!(broker.call_counts().await.subscribe, 1);
    }

    #[tokio::test]
    async fn test_consumer_start_surfaces_provisioning_failure() {
        let broker = Arc::new(LocalBroker::default());
        broker.set_fail_on_lookup(true);

        let result = EventConsumer::start(
            &fast_config("accounts-service"),
            broker.clone(),
            broker,
            vec![],
        )
        .await;

        assert!(matches!(result, Err(ServiceError::Infrastructure(_))));
    }
}
