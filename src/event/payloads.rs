//! Typed payloads for auth service events.
//!
//! Each payload is a closed record. Fields are never renamed without bumping
//! the event's schema version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Known values for [`LoginFailed::reason`].
pub struct LoginFailureReason;

impl LoginFailureReason {
    pub const INVALID_CREDENTIALS: &'static str = "invalid_credentials";
    pub const INACTIVE_USER: &'static str = "inactive_user";
}

/// `auth.user.registered`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: String,
    pub email: String,
    pub username: String,
    pub registered_at: DateTime<Utc>,
}

/// `auth.user.logged_in`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoggedIn {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub logged_in_at: DateTime<Utc>,
}

/// `auth.user.logged_out` and `auth.user.logged_out_all`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoggedOut {
    pub user_id: String,
    #[serde(default)]
    pub logout_all_devices: bool,
    pub logged_out_at: DateTime<Utc>,
}

/// `auth.login.failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFailed {
    pub username: String,
    /// One of the [`LoginFailureReason`] constants.
    pub reason: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// `auth.token.refreshed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRefreshed {
    pub user_id: String,
    pub old_token_id: String,
    pub new_token_id: String,
    pub refreshed_at: DateTime<Utc>,
}

/// `auth.password.changed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordChanged {
    pub user_id: String,
    pub changed_at: DateTime<Utc>,
}

/// `auth.user.updated`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdated {
    pub user_id: String,
    /// Names of the profile fields that changed.
    pub updated_fields: Vec<String>,
    pub updated_at: DateTime<Utc>,
}
