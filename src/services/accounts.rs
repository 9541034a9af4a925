//! Accounts service handlers for auth events.
//!
//! Payloads are decoded strictly: an event missing required fields fails
//! with `HandlerError::Payload` instead of being logged with blanks. The
//! subscriber still deletes the message, so this only changes what is
//! logged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::event::payloads::{UserLoggedIn, UserRegistered};
use crate::event::{AuthEventType, DomainEvent};
use crate::handlers::{EventHandler, HandlerError};

/// Records newly registered users.
///
/// Requires `user_id`, `email`, `username` and `registered_at`.
#[derive(Debug, Default)]
pub struct UserRegisteredHandler;

#[async_trait]
impl EventHandler for UserRegisteredHandler {
    fn name(&self) -> &str {
        "accounts.user_registered"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        AuthEventType::UserRegistered == event_type
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let payload: UserRegistered = event.payload_as()?;
        info!(
            user_id = %payload.user_id,
            email = %payload.email,
            username = %payload.username,
            event_id = event.event_id(),
            "User registered"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DeletedUser {
    user_id: String,
}

/// Cleans up after deleted users. Only `user_id` is read.
#[derive(Debug, Default)]
pub struct UserDeletedHandler;

#[async_trait]
impl EventHandler for UserDeletedHandler {
    fn name(&self) -> &str {
        "accounts.user_deleted"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        AuthEventType::UserDeleted == event_type
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let payload: DeletedUser = event.payload_as()?;
        info!(
            user_id = %payload.user_id,
            event_id = event.event_id(),
            "User deleted"
        );
        Ok(())
    }
}

/// Tracks login activity.
#[derive(Debug, Default)]
pub struct UserLoggedInHandler;

#[async_trait]
impl EventHandler for UserLoggedInHandler {
    fn name(&self) -> &str {
        "accounts.user_logged_in"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        AuthEventType::UserLoggedIn == event_type
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        let payload: UserLoggedIn = event.payload_as()?;
        debug!(
            user_id = %payload.user_id,
            ip_address = payload.ip_address.as_deref().unwrap_or("-"),
            "User logged in"
        );
        Ok(())
    }
}

/// Every handler the accounts service registers.
pub fn handlers() -> Vec<Arc<dyn EventHandler>> {
    vec![
        Arc::new(UserRegisteredHandler),
        Arc::new(UserDeletedHandler),
        Arc::new(UserLoggedInHandler),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRegistry;
    use chrono::Utc;
    use serde_json::json;

    fn registered() -> DomainEvent {
        DomainEvent::new(
            "auth.user.registered",
            json!({
                "user_id": "u1",
                "email": "a@b.com",
                "username": "alice",
                "registered_at": Utc::now(),
            }),
        )
    }

    #[test]
    fn test_each_handler_claims_one_type() {
        let handlers = handlers();
        let claims = |event_type: &str| handlers.iter().filter(|h| h.can_handle(event_type)).count();

        assert_eq!(claims("auth.user.registered"), 1);
        assert_eq!(claims("auth.user.deleted"), 1);
        assert_eq!(claims("auth.user.logged_in"), 1);
        assert_eq!(claims("auth.user.logged_out"), 0);
    }

    #[tokio::test]
    async fn test_registered_handler_decodes_payload() {
        UserRegisteredHandler.handle(&registered()).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_handler_error() {
        let event = DomainEvent::new("auth.user.registered", json!({"user_id": "u1"}));

        let err = UserRegisteredHandler.handle(&event).await.unwrap_err();
        assert!(matches!(err, HandlerError::Payload(_)));
    }

    #[tokio::test]
    async fn test_deleted_handler_needs_only_user_id() {
        let event = DomainEvent::new("auth.user.deleted", json!({"user_id": "u1", "extra": 1}));
        UserDeletedHandler.handle(&event).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_dispatch_with_accounts_handlers() {
        let registry = HandlerRegistry::new();
        for handler in handlers() {
            registry.register(handler).await;
        }

        let outcome = registry.dispatch(&registered()).await;
        assert_eq!(outcome.matched, 1);
        assert!(outcome.all_succeeded());

        let logged_in = DomainEvent::new(
            "auth.user.logged_in",
            json!({"user_id": "u1", "username": "alice", "logged_in_at": Utc::now()}),
        );
        let outcome = registry.dispatch(&logged_in).await;
        assert_eq!(outcome.matched, 1);
        assert!(outcome.all_succeeded());
    }
}
