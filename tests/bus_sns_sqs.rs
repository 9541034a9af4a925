//! SNS/SQS fan-out integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_sns_sqs --features sns-sqs -- --nocapture
//!
//! Uses LocalStack to emulate AWS SNS/SQS locally.
//! Tests share a single LocalStack container to avoid rootless port conflicts.

#![cfg(feature = "sns-sqs")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowforward_events::broker::{AwsBroker, QueueClient};
use flowforward_events::bus::{PublisherExt, SqsSubscriber, Subscriber};
use flowforward_events::config::{BrokerConfig, Config};
use flowforward_events::event::payloads::UserRegistered;
use flowforward_events::event::DomainEvent;
use flowforward_events::handlers::{EventHandler, HandlerError};
use flowforward_events::provision::Provisioner;
use flowforward_events::services::{EventConsumer, EventProducer};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tokio::sync::{mpsc, OnceCell};

/// Shared LocalStack container and endpoint URL.
static LOCALSTACK: OnceCell<(ContainerAsync<GenericImage>, String)> = OnceCell::const_new();

/// Get the shared LocalStack endpoint, starting the container if needed.
async fn get_localstack_endpoint() -> String {
    let (_, endpoint) = LOCALSTACK
        .get_or_init(|| async {
            println!("Starting shared LocalStack container...");
            let (container, endpoint) = start_localstack_internal().await;
            println!("LocalStack available at: {}", endpoint);
            (container, endpoint)
        })
        .await;
    endpoint.clone()
}

async fn start_localstack_internal() -> (ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("localstack/localstack", "latest")
        .with_exposed_port(4566.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready."));

    let container = image
        .with_env_var("SERVICES", "sns,sqs")
        .with_env_var("AWS_DEFAULT_REGION", "us-east-1")
        .with_env_var("EAGER_SERVICE_LOADING", "1")
        .with_env_var("DISABLE_EVENTS", "1")
        .with_env_var("SKIP_INFRA_DOWNLOADS", "1")
        .with_env_var("DNS_DISABLED", "true")
        .with_env_var("LOCALSTACK_HOST", "localhost")
        .with_startup_timeout(Duration::from_secs(180))
        .start()
        .await
        .expect("Failed to start localstack container");

    // SNS/SQS need a moment after "Ready."
    tokio::time::sleep(Duration::from_secs(5)).await;

    let host_port = container
        .get_host_port_ipv4(4566)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    (container, format!("http://{}:{}", host, host_port))
}

/// Config with unique resource names so tests sharing the container don't collide.
async fn localstack_config(service: &str) -> (Config, Arc<AwsBroker>) {
    let endpoint_url = get_localstack_endpoint().await;

    std::env::set_var("AWS_ACCESS_KEY_ID", "test");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "test");
    std::env::set_var("AWS_DEFAULT_REGION", "us-east-1");

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let mut config = Config::for_service(service);
    config.broker = BrokerConfig {
        endpoint_url: Some(endpoint_url),
        ..BrokerConfig::default()
    };
    config.publisher.topic_name = format!("auth-events-{}", &suffix[..8]);
    config.subscriber.topics = vec![config.publisher.topic_name.clone()];
    config.subscriber.queue_name = format!("accounts-events-{}", &suffix[..8]);
    config.subscriber.wait_time_secs = 1;
    config.subscriber.poll_interval_ms = 100;

    let broker = Arc::new(AwsBroker::connect(&config.broker).await);
    (config, broker)
}

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

#[tokio::test]
async fn test_sns_sqs_publish_and_consume() {
    let (config, broker) = localstack_config("accounts-service").await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consumer = EventConsumer::start(
        &config,
        broker.clone(),
        broker.clone(),
        vec![Arc::new(Forward(tx))],
    )
    .await
    .expect("Failed to start consumer");

    let producer = EventProducer::start(&config, broker.clone(), broker.clone())
        .await
        .expect("Failed to start producer");

    let published = producer
        .auth_events()
        .publish_user_registered("u1", "a@b.com", "alice", Some("it-1"))
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed");

    assert_eq!(received.event_id(), published.event_id());
    assert_eq!(received.metadata().correlation_id(), Some("it-1"));
    let payload: UserRegistered = received.payload_as().unwrap();
    assert_eq!(payload.username, "alice");

    consumer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sns_sqs_provisioning_is_idempotent() {
    let (config, broker) = localstack_config("provisioner").await;
    let provisioner = Provisioner::new(
        broker.clone(),
        broker.clone(),
        config.broker.clone(),
        config.provisioning.clone(),
    );

    let topic = provisioner
        .ensure_topic(&config.publisher.topic_name)
        .await
        .unwrap();
    assert_eq!(topic.arn, provisioner.topic_arn(&config.publisher.topic_name));

    let (queue, first) = provisioner
        .ensure_subscription(&config.subscriber.queue_name, &topic)
        .await
        .unwrap();
    let (queue_again, second) = provisioner
        .ensure_subscription(&config.subscriber.queue_name, &topic)
        .await
        .unwrap();

    assert_eq!(queue, queue_again);
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.arn, second.arn);
}

#[tokio::test]
async fn test_sns_sqs_poison_message_is_removed() {
    let (config, broker) = localstack_config("accounts-service").await;
    let provisioner = Provisioner::new(
        broker.clone(),
        broker.clone(),
        config.broker.clone(),
        config.provisioning.clone(),
    );
    let queue = provisioner
        .ensure_queue(&config.subscriber.queue_name)
        .await
        .unwrap();

    broker
        .send_message(&queue.url, "not json at all")
        .await
        .unwrap();

    let subscriber = SqsSubscriber::new(
        broker.clone(),
        queue.url.clone(),
        config.subscriber.poll_settings(),
    );
    subscriber.connect().await.unwrap();

    assert_eq!(subscriber.poll_once().await.unwrap(), 1);
    // Deleted, not left for redelivery.
    assert_eq!(subscriber.poll_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sns_sqs_fan_out_to_two_queues() {
    let (config, broker) = localstack_config("auth-service").await;
    let provisioner = Provisioner::new(
        broker.clone(),
        broker.clone(),
        config.broker.clone(),
        config.provisioning.clone(),
    );
    let topic = provisioner
        .ensure_topic(&config.publisher.topic_name)
        .await
        .unwrap();
    let (accounts, _) = provisioner
        .ensure_subscription(&format!("{}-a", config.subscriber.queue_name), &topic)
        .await
        .unwrap();
    let (audit, _) = provisioner
        .ensure_subscription(&format!("{}-b", config.subscriber.queue_name), &topic)
        .await
        .unwrap();

    let producer = EventProducer::start(&config, broker.clone(), broker.clone())
        .await
        .unwrap();
    let event = DomainEvent::new("auth.password.changed", serde_json::json!({"user_id": "u1"}));
    producer.publisher().publish_event(&event, None).await.unwrap();

    for queue in [&accounts, &audit] {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = SqsSubscriber::new(
            broker.clone(),
            queue.url.clone(),
            config.subscriber.poll_settings(),
        );
        subscriber.register_handler(Arc::new(Forward(tx))).await;
        subscriber.start(None).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("Timed out waiting for fan-out")
            .expect("Channel closed");
        assert_eq!(received.event_id(), event.event_id());

        subscriber.disconnect().await.unwrap();
    }
}
