//! flowforward-accounts-consumer: accounts service event consumer
//!
//! Provisions the accounts queue and its topic subscriptions, then polls it
//! and runs the accounts handlers until interrupted.
//!
//! ## Configuration
//! - First argument: config file path (optional)
//! - FLOWFORWARD_CONFIG: config file path (optional)
//! - FLOWFORWARD__SECTION__KEY: per-key overrides
//! - FLOWFORWARD_LOG: tracing filter (default: info)

use std::sync::Arc;

use tracing::info;

use flowforward_events::broker::AwsBroker;
use flowforward_events::config::Config;
use flowforward_events::event::UNKNOWN_SOURCE;
use flowforward_events::services::{accounts, EventConsumer};
use flowforward_events::utils::bootstrap::{init_tracing, retry_startup};

const SERVICE_NAME: &str = "accounts-service";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let mut config = Config::load(path.as_deref())?;
    if config.service_name == UNKNOWN_SOURCE {
        config.service_name = SERVICE_NAME.to_string();
    }

    let broker = Arc::new(AwsBroker::connect(&config.broker).await);

    let consumer = retry_startup("start consumer", &config.subscriber.queue_name, || {
        EventConsumer::start(
            &config,
            broker.clone(),
            broker.clone(),
            accounts::handlers(),
        )
    })
    .await?;

    info!(queue_url = %consumer.queue().url, "flowforward-accounts-consumer started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    consumer.shutdown().await?;
    Ok(())
}
