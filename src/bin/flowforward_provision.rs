//! flowforward-provision: create topics, queues and subscriptions
//!
//! Runs the same idempotent provisioning the services perform at startup,
//! for deploy pipelines that want infrastructure in place first. Safe to
//! run repeatedly.
//!
//! ## Configuration
//! Same sources as the services: optional config path argument,
//! FLOWFORWARD_CONFIG, FLOWFORWARD__SECTION__KEY overrides.

use std::sync::Arc;

use tracing::info;

use flowforward_events::broker::AwsBroker;
use flowforward_events::config::Config;
use flowforward_events::provision::Provisioner;
use flowforward_events::utils::bootstrap::{init_tracing, retry_startup};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;

    let broker = Arc::new(AwsBroker::connect(&config.broker).await);
    let provisioner = Provisioner::new(
        broker.clone(),
        broker,
        config.broker.clone(),
        config.provisioning.clone(),
    );

    let topic = retry_startup("ensure topic", &config.publisher.topic_name, || {
        provisioner.ensure_topic(&config.publisher.topic_name)
    })
    .await?;
    info!(topic = %topic.name, arn = %topic.arn, "Publisher topic ready");

    let mut topics = Vec::with_capacity(config.subscriber.topics.len());
    for name in &config.subscriber.topics {
        topics.push(provisioner.ensure_topic(name).await?);
    }

    let (queue, subscriptions) = provisioner
        .ensure_subscriptions(&config.subscriber.queue_name, &topics)
        .await?;
    for subscription in &subscriptions {
        info!(
            queue = %queue.name,
            topic_arn = %subscription.topic_arn,
            subscription_arn = %subscription.arn,
            created = subscription.created,
            "Subscription ready"
        );
    }

    Ok(())
}
