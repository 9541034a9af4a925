//! Event type catalogue.
//!
//! Event types are plain strings on the wire; these enums give producers and
//! handlers a typed name for each one.

use std::fmt;
use std::str::FromStr;

/// Error returned when a string is not a known event type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event type: {0}")]
pub struct UnknownEventType(pub String);

macro_rules! event_types {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire name of this event type.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $value, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownEventType;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $value => Ok($name::$variant), )+
                    other => Err(UnknownEventType(other.to_string())),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }
    };
}

event_types! {
    /// Event types applicable across all domains.
    SystemEventType {
        Startup => "system.startup",
        Shutdown => "system.shutdown",
        HealthCheck => "system.health_check",
    }
}

event_types! {
    /// Authentication service event types.
    AuthEventType {
        // User lifecycle
        UserRegistered => "auth.user.registered",
        UserActivated => "auth.user.activated",
        UserDeactivated => "auth.user.deactivated",
        UserDeleted => "auth.user.deleted",
        UserUpdated => "auth.user.updated",
        // Authentication
        UserLoggedIn => "auth.user.logged_in",
        UserLoggedOut => "auth.user.logged_out",
        UserLoggedOutAll => "auth.user.logged_out_all",
        LoginFailed => "auth.login.failed",
        // Tokens
        TokenRefreshed => "auth.token.refreshed",
        TokenRevoked => "auth.token.revoked",
        // Passwords
        PasswordChanged => "auth.password.changed",
        PasswordResetRequested => "auth.password.reset_requested",
        PasswordResetCompleted => "auth.password.reset_completed",
    }
}

impl AuthEventType {
    /// Domain prefix shared by every auth event type.
    pub const DOMAIN: &'static str = "auth";
}
