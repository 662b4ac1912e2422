//! Error types for taskmill operations.

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type used throughout taskmill.
pub type QueueResult<T> = Result<T, QueueError>;

/// Main error type for taskmill operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// No handler is registered under the requested name
    #[error("handler '{handler}' is not registered")]
    HandlerNotRegistered {
        /// The handler name that was not found
        handler: String,
    },

    /// A max-retries override exceeded the system-wide cap
    #[error("max retries {requested} exceeds the hard limit of {limit}")]
    MaxRetriesLimit {
        /// Requested retry cap
        requested: u32,
        /// The system-wide hard limit
        limit: u32,
    },

    /// A configured payload validator rejected the payload
    #[error("invalid payload for handler '{handler}': {message}")]
    InvalidPayload {
        /// Target handler name
        handler: String,
        /// Validator message
        message: String,
    },

    /// A status update would violate the task lifecycle
    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: TaskStatus,
        /// Requested status
        to: TaskStatus,
    },

    /// Configuration error, fatal at construction
    #[error("configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Storage backend error
    #[error("storage error: {message}")]
    Storage {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A user handler returned an error
    #[error("handler execution failed: {message}")]
    HandlerFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The worker pool is already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// The worker pool is not running
    #[error("worker pool is not running")]
    NotRunning,

    /// Redis backend error
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Database backend error
    #[cfg(feature = "postgres-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-storage")))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a storage error with an underlying cause.
    pub fn storage<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a storage error without an underlying cause.
    pub fn storage_message(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a handler failure from an error message.
    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::HandlerFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HandlerNotRegistered { .. } => "HANDLER_NOT_REGISTERED",
            Self::MaxRetriesLimit { .. } => "MAX_RETRIES_LIMIT",
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Config { .. } => "CONFIG",
            Self::Storage { .. } => "STORAGE",
            Self::HandlerFailed { .. } => "HANDLER_FAILED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            #[cfg(feature = "redis-storage")]
            Self::Redis(_) => "REDIS",
            #[cfg(feature = "postgres-storage")]
            Self::Database(_) => "DATABASE",
        }
    }
}
