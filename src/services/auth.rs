//! Auth service event publishing.
//!
//! Route handlers in the auth service call these after their database
//! write commits. Each method builds the typed payload, stamps the source
//! and optional correlation id, and publishes. Errors are returned so the
//! caller can log them; a failed publish never undoes the write.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::bus::{PublishError, Publisher, PublisherExt};
use crate::event::payloads::{
    LoginFailed, PasswordChanged, TokenRefreshed, UserLoggedIn, UserLoggedOut, UserRegistered,
    UserUpdated,
};
use crate::event::{AuthEventType, DomainEvent, EventMetadata};

/// Default `source` for events published by the auth service.
pub const AUTH_SERVICE_SOURCE: &str = "auth-service";

/// Typed facade over a [`Publisher`] for auth events.
pub struct AuthEventPublisher {
    publisher: Arc<dyn Publisher>,
    source: String,
    topic: Option<String>,
}

impl AuthEventPublisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            source: AUTH_SERVICE_SOURCE.to_string(),
            topic: None,
        }
    }

    /// Override the `source` stamped on events.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Publish to this topic instead of the publisher's default.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    async fn send<P>(
        &self,
        event_type: AuthEventType,
        payload: P,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<P>, PublishError>
    where
        P: Serialize + Send + Sync,
    {
        let mut metadata = EventMetadata::new(&self.source);
        if let Some(correlation_id) = correlation_id {
            metadata = metadata.with_correlation_id(correlation_id);
        }
        let event = DomainEvent::with_metadata(event_type.as_str(), metadata, payload);

        self.publisher
            .publish_event(&event, self.topic.as_deref())
            .await?;

        debug!(
            event_type = event.event_type(),
            event_id = event.event_id(),
            "Published auth event"
        );
        Ok(event)
    }

    pub async fn publish_user_registered(
        &self,
        user_id: &str,
        email: &str,
        username: &str,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<UserRegistered>, PublishError> {
        let payload = UserRegistered {
            user_id: user_id.to_string(),
            email: email.to_string(),
            username: username.to_string(),
            registered_at: Utc::now(),
        };
        self.send(AuthEventType::UserRegistered, payload, correlation_id)
            .await
    }

    pub async fn publish_user_logged_in(
        &self,
        user_id: &str,
        username: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<UserLoggedIn>, PublishError> {
        let payload = UserLoggedIn {
            user_id: user_id.to_string(),
            username: username.to_string(),
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            logged_in_at: Utc::now(),
        };
        self.send(AuthEventType::UserLoggedIn, payload, correlation_id)
            .await
    }

    /// Publishes `auth.user.logged_out_all` when every device was logged out.
    pub async fn publish_user_logged_out(
        &self,
        user_id: &str,
        logout_all_devices: bool,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<UserLoggedOut>, PublishError> {
        let event_type = if logout_all_devices {
            AuthEventType::UserLoggedOutAll
        } else {
            AuthEventType::UserLoggedOut
        };
        let payload = UserLoggedOut {
            user_id: user_id.to_string(),
            logout_all_devices,
            logged_out_at: Utc::now(),
        };
        self.send(event_type, payload, correlation_id).await
    }

    /// `reason` is normally one of the `LoginFailureReason` constants.
    pub async fn publish_login_failed(
        &self,
        username: &str,
        reason: &str,
        ip_address: Option<&str>,
        user_agent: Option<&str>,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<LoginFailed>, PublishError> {
        let payload = LoginFailed {
            username: username.to_string(),
            reason: reason.to_string(),
            ip_address: ip_address.map(str::to_string),
            user_agent: user_agent.map(str::to_string),
            attempted_at: Utc::now(),
        };
        self.send(AuthEventType::LoginFailed, payload, correlation_id)
            .await
    }

    pub async fn publish_token_refreshed(
        &self,
        user_id: &str,
        old_token_id: &str,
        new_token_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<TokenRefreshed>, PublishError> {
        let payload = TokenRefreshed {
            user_id: user_id.to_string(),
            old_token_id: old_token_id.to_string(),
            new_token_id: new_token_id.to_string(),
            refreshed_at: Utc::now(),
        };
        self.send(AuthEventType::TokenRefreshed, payload, correlation_id)
            .await
    }

    pub async fn publish_password_changed(
        &self,
        user_id: &str,
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<PasswordChanged>, PublishError> {
        let payload = PasswordChanged {
            user_id: user_id.to_string(),
            changed_at: Utc::now(),
        };
        self.send(AuthEventType::PasswordChanged, payload, correlation_id)
            .await
    }

    pub async fn publish_user_updated(
        &self,
        user_id: &str,
        updated_fields: &[&str],
        correlation_id: Option<&str>,
    ) -> Result<DomainEvent<UserUpdated>, PublishError> {
        let payload = UserUpdated {
            user_id: user_id.to_string(),
            updated_fields: updated_fields.iter().map(|f| f.to_string()).collect(),
            updated_at: Utc::now(),
        };
        self.send(AuthEventType::UserUpdated, payload, correlation_id)
            .await
    }
}
