//! Error types for the scheduler daemons.
//!
//! Groups failures by the resource that produced them so the loop can tell
//! a dropped broker connection (reconnect and retry once) from a bad
//! payload (never retried) from a database outage (rebuild the session).

use std::fmt;

use rollcall_core::CoreError;
use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised while scheduling, publishing or draining.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Database query or transaction failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Broker connection was lost or never established.
    #[error("broker connection lost: {message}")]
    BrokerConnectionLost {
        /// Transport error message
        message: String,
    },

    /// Broker rejected an operation on a healthy connection.
    #[error("broker error: {message}")]
    BrokerError {
        /// Broker error message
        message: String,
    },

    /// Notification listener failed.
    #[error("notifier error: {message}")]
    NotifierError {
        /// Listener error message
        message: String,
    },

    /// Event could not be encoded or a message could not be decoded.
    #[error("serialization error: {message}")]
    SerializationError {
        /// Serialization error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal scheduler error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl SchedulerError {
    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a connection-lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::BrokerConnectionLost { message: message.into() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::BrokerError { message: message.into() }
    }

    /// Creates a notifier error.
    pub fn notifier(message: impl Into<String>) -> Self {
        Self::NotifierError { message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether the failure is a dropped broker connection that a fresh
    /// connection may fix.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::BrokerConnectionLost { .. })
    }

    /// Determines if this error represents a temporary failure.
    ///
    /// Database, transport and listener failures are retryable on a later
    /// iteration. Serialization and configuration failures will fail the
    /// same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DatabaseError { .. }
            | Self::BrokerConnectionLost { .. }
            | Self::BrokerError { .. }
            | Self::NotifierError { .. } => true,

            Self::SerializationError { .. }
            | Self::ConfigurationError { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Category for log fields.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for SchedulerError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Serialization(e) => Self::serialization(e.to_string()),
            CoreError::InvalidInput(message) => Self::internal(message),
            other => Self::database(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        Self::from(CoreError::from(err))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Category of scheduler error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Database operations.
    Database,
    /// Broker transport or protocol.
    Broker,
    /// Notification listener.
    Notifier,
    /// Payload encoding.
    Serialization,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&SchedulerError> for ErrorCategory {
    fn from(error: &SchedulerError) -> Self {
        match error {
            SchedulerError::DatabaseError { .. } => Self::Database,
            SchedulerError::BrokerConnectionLost { .. } | SchedulerError::BrokerError { .. } => {
                Self::Broker
            },
            SchedulerError::NotifierError { .. } => Self::Notifier,
            SchedulerError::SerializationError { .. } => Self::Serialization,
            SchedulerError::ConfigurationError { .. } => Self::Configuration,
            SchedulerError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Broker => write!(f, "broker"),
            Self::Notifier => write!(f, "notifier"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(SchedulerError::database("connection reset").is_retryable());
        assert!(SchedulerError::connection_lost("socket closed").is_retryable());
        assert!(SchedulerError::notifier("listener gone").is_retryable());

        assert!(!SchedulerError::serialization("bad json").is_retryable());
        assert!(!SchedulerError::configuration("empty url").is_retryable());
        assert!(!SchedulerError::internal("missing row").is_retryable());
    }

    #[test]
    fn only_transport_loss_triggers_reconnect() {
        assert!(SchedulerError::connection_lost("eof").is_connection_lost());
        assert!(!SchedulerError::broker("NOT_FOUND - no exchange").is_connection_lost());
    }

    #[test]
    fn core_errors_keep_their_meaning() {
        let err = SchedulerError::from(CoreError::Database("pool timed out".to_string()));
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::Database);

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = SchedulerError::from(CoreError::from(json));
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::Serialization);
    }

    #[test]
    fn error_display_format() {
        let error = SchedulerError::connection_lost("broken pipe");
        assert_eq!(error.to_string(), "broker connection lost: broken pipe");
        assert_eq!(ErrorCategory::from(&error).to_string(), "broker");
    }
}
