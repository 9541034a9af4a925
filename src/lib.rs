//! FlowForward - event publish/subscribe fan-out
//!
//! Services publish domain events to SNS topics; each consuming service
//! owns an SQS queue subscribed to the topics it cares about and
//! dispatches received events to its registered handlers.

pub mod broker;
pub mod bus;
pub mod config;
pub mod event;
pub mod handlers;
pub mod provision;
pub mod services;
pub mod utils;

pub use bus::{Publisher, PublisherExt, Subscriber};
pub use event::{DomainEvent, EventMetadata};
pub use handlers::{EventHandler, HandlerError};
