//! Service wiring.
//!
//! - `auth`: typed publishing facade used by the auth service
//! - `accounts`: handlers the accounts service runs for auth events
//! - `lifecycle`: startup/shutdown of producers and consumers

pub mod accounts;
pub mod auth;
pub mod lifecycle;

pub use accounts::{UserDeletedHandler, UserLoggedInHandler, UserRegisteredHandler};
pub use auth::{AuthEventPublisher, AUTH_SERVICE_SOURCE};
pub use lifecycle::{EventConsumer, EventProducer};

use crate::bus::{PublishError, SubscriptionError};
use crate::config::ConfigError;
use crate::provision::InfrastructureError;

/// Startup and shutdown failures.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
