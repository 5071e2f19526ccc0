//! Error types for Stratoform.
//!
//! This module defines the error taxonomy used throughout the crate. The
//! retry executor keys its classification off these variants: transport
//! failures, rate limiting, and remote-internal faults are retryable,
//! everything else aborts the calling operation immediately.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Stratoform operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Stratoform.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Remote API Errors
    // ========================================================================
    /// Network-level failure reaching the remote API.
    #[error("Transport error during '{action}': {message}")]
    Transport {
        /// API action that was being called
        action: String,
        /// Error message
        message: String,
    },

    /// The remote API rejected the call due to rate limiting.
    #[error("Rate limited during '{action}'")]
    RateLimited {
        /// API action that was being called
        action: String,
        /// Server-requested delay before the next attempt, if provided
        retry_after: Option<Duration>,
    },

    /// The remote API reported an internal fault (5xx class).
    #[error("Remote internal error during '{action}' ({code}): {message}")]
    RemoteInternal {
        /// API action that was being called
        action: String,
        /// Remote error code
        code: String,
        /// Error message
        message: String,
    },

    /// The remote API rejected the request as malformed or conflicting.
    #[error("Invalid request for '{action}': {message}")]
    InvalidRequest {
        /// API action that was being called
        action: String,
        /// Error message
        message: String,
    },

    /// Authentication or authorization failed.
    #[error("Authentication failed for '{action}': {message}")]
    Auth {
        /// API action that was being called
        action: String,
        /// Error message
        message: String,
    },

    /// An account quota prevents the operation.
    #[error("Quota exceeded for '{resource}': {message}")]
    QuotaExceeded {
        /// Resource kind the quota applies to
        resource: String,
        /// Error message
        message: String,
    },

    /// The referenced entity does not exist remotely.
    #[error("'{entity}' not found")]
    NotFound {
        /// Entity identifier or description
        entity: String,
    },

    // ========================================================================
    // Entity State Errors
    // ========================================================================
    /// The polled entity reached a status from the failure set.
    #[error("'{entity}' entered failure status '{status}'")]
    StateFailed {
        /// Entity identifier or description
        entity: String,
        /// Observed failure status
        status: String,
    },

    // ========================================================================
    // Timeout & Cancellation Errors
    // ========================================================================
    /// A retried operation exhausted its wall-clock budget.
    #[error("Operation '{operation}' timed out after {elapsed_secs}s")]
    Timeout {
        /// Operation label
        operation: String,
        /// Elapsed seconds when the deadline fired
        elapsed_secs: u64,
        /// Last error observed before the deadline
        #[source]
        source: Option<Box<Error>>,
    },

    /// A status wait exhausted its timeout.
    #[error("Timed out waiting for '{entity}' after {elapsed_secs}s (last status: {last_status})")]
    WaitTimeout {
        /// Entity identifier or description
        entity: String,
        /// Elapsed seconds when the timeout fired
        elapsed_secs: u64,
        /// Last observed status, or "absent" if the entity was never seen
        last_status: String,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Field Errors
    // ========================================================================
    /// A required declared field is missing.
    #[error("Required field '{0}' is missing")]
    MissingField(String),

    /// A declared field has an invalid value or combination.
    #[error("Invalid value for field '{field}': {message}")]
    InvalidField {
        /// Field name
        field: String,
        /// Error message
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// Creation assigned a handle but a later step failed; the entity
    /// exists remotely and must be recorded by the caller.
    #[error("Create of {resource} '{handle}' did not complete: {source}")]
    CreateIncomplete {
        /// Resource type name
        resource: String,
        /// Handle of the partially created entity
        handle: String,
        /// Failure that interrupted creation
        #[source]
        source: Box<Error>,
    },

    /// An update step failed after earlier steps were applied.
    #[error("Update step '{step}' of {resource} '{handle}' failed: {source}")]
    UpdateFailed {
        /// Resource type name
        resource: String,
        /// Update step name
        step: String,
        /// Handle of the entity being updated
        handle: String,
        /// Failure that interrupted the update
        #[source]
        source: Box<Error>,
    },

    // ========================================================================
    // Serialization Errors
    // ========================================================================
    /// JSON parsing or serialization error.
    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Other Errors
    // ========================================================================
    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error with source.
    #[error("{message}")]
    Other {
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Creates a new transport error.
    pub fn transport(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Creates a new rate-limited error.
    pub fn rate_limited(action: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            action: action.into(),
            retry_after,
        }
    }

    /// Creates a new remote-internal error.
    pub fn remote_internal(
        action: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::RemoteInternal {
            action: action.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a new invalid-request error.
    pub fn invalid_request(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Creates a new authentication error.
    pub fn auth(action: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            action: action.into(),
            message: message.into(),
        }
    }

    /// Creates a new not-found error.
    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    /// Creates a new state-failed error.
    pub fn state_failed(entity: impl Into<String>, status: impl Into<String>) -> Self {
        Self::StateFailed {
            entity: entity.into(),
            status: status.into(),
        }
    }

    /// Creates a new timeout error wrapping the last observed failure.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration, source: Option<Error>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs: elapsed.as_secs(),
            source: source.map(Box::new),
        }
    }

    /// Creates a new wait-timeout error.
    pub fn wait_timeout(
        entity: impl Into<String>,
        elapsed: Duration,
        last_status: Option<&str>,
    ) -> Self {
        Self::WaitTimeout {
            entity: entity.into(),
            elapsed_secs: elapsed.as_secs(),
            last_status: last_status.unwrap_or("absent").to_string(),
        }
    }

    /// Creates a new missing-field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }

    /// Creates a new invalid-field error.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a new create-incomplete error.
    pub fn create_incomplete(
        resource: impl Into<String>,
        handle: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::CreateIncomplete {
            resource: resource.into(),
            handle: handle.into(),
            source: Box::new(source),
        }
    }

    /// Creates a new update-failed error.
    pub fn update_failed(
        resource: impl Into<String>,
        step: impl Into<String>,
        handle: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::UpdateFailed {
            resource: resource.into(),
            step: step.into(),
            handle: handle.into(),
            source: Box::new(source),
        }
    }

    /// Returns true if a retry executor may re-attempt after this error.
    ///
    /// The retryable set is closed: transport faults, rate limiting, and
    /// remote-internal errors. Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::RateLimited { .. } | Error::RemoteInternal { .. }
        )
    }

    /// Returns true if this error means the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if this error came from an exhausted time budget.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::WaitTimeout { .. })
    }

    /// Returns the server-requested retry delay, if this error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Adds context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Adds context with a closure that is only evaluated on error.
    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Other {
            message: message.into(),
            source: Some(Box::new(e)),
        })
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| Error::Other {
            message: f().into(),
            source: Some(Box::new(e)),
        })
    }
}
