use std::time::Duration;

/// Errors raised by a [`Broker`](crate::Broker) implementation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("broker connection unavailable: {0}")]
    Connection(#[source] sqlx::Error),

    /// The broker was reached but rejected the operation.
    #[error("broker query failed: {0}")]
    Database(#[source] sqlx::Error),

    /// Applying the broker schema failed.
    #[error("failed to migrate broker schema: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl BrokerError {
    /// Whether the error is a transient connectivity problem.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error),
            other => Self::Database(other),
        }
    }
}

/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The target queue is not part of the static queue configuration.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The payload could not be converted to JSON.
    #[error("failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The broker rejected or could not receive the record.
    #[error(transparent)]
    BrokerError(#[from] BrokerError),
}

/// Error type for administrative queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is not part of the static queue configuration.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The broker rejected or could not receive the operation.
    #[error(transparent)]
    BrokerError(#[from] BrokerError),
}

/// Errors raised while building or querying a [`JobRegistry`](crate::JobRegistry).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A job with the same name was already registered.
    #[error("job type {0:?} is already registered")]
    DuplicateJobType(String),

    /// No handler is registered under this name.
    #[error("unknown job type {0:?}")]
    UnknownJobType(String),
}

/// Errors raised by static configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Two queues share a name.
    #[error("queue {0:?} is configured more than once")]
    DuplicateQueue(String),

    /// A queue was configured without any concurrency.
    #[error("queue {0:?} must have a concurrency of at least 1")]
    ZeroConcurrency(String),

    /// A rate limit admits nothing.
    #[error("queue {0:?} has an empty rate limit window")]
    InvalidRateLimit(String),

    /// An environment variable held an unusable value.
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },

    /// The queue configuration file could not be read or written.
    #[error("failed to access queue configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The queue configuration file is not valid TOML for this schema.
    #[error("failed to parse queue configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The queue configuration could not be rendered back to TOML.
    #[error("failed to render queue configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

/// One event handler that did not finish successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    /// Position of the handler in registration order
    pub index: usize,
    /// What went wrong
    pub message: String,
}

/// Returned by [`Emission::wait`](crate::Emission::wait) when handlers failed.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{} of the handlers for event {event} failed", failures.len())]
pub struct EmitError {
    /// Name of the emitted event
    pub event: &'static str,
    /// Failed handlers, in registration order
    pub failures: Vec<HandlerFailure>,
}

/// Why a single execution attempt of a job record did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The record names a job type without a registered handler.
    #[error("unknown job type {0:?}")]
    UnknownJobType(String),

    /// The stored payload does not match the handler's payload type.
    #[error("invalid job payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),

    /// The handler returned an error.
    #[error("{0:#}")]
    Handler(anyhow::Error),

    /// The handler did not finish within the configured timeout.
    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    /// The handler panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl ExecutionError {
    /// Whether retrying the same record can never succeed.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::UnknownJobType(_) | Self::InvalidPayload(_) => true,
            Self::Handler(error) => error.chain().any(|cause| cause.is::<Unrecoverable>()),
            Self::Timeout(_) | Self::Panicked(_) => false,
        }
    }
}

/// Marker error that fails a job permanently, skipping the remaining attempts.
///
/// ```rust,ignore
/// return Err(Unrecoverable::new("user was deleted").into());
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Unrecoverable(String);

impl Unrecoverable {
    /// Create a new unrecoverable error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn handler_errors_are_retryable_unless_marked() {
        assert!(!ExecutionError::Handler(anyhow!("smtp down")).is_terminal());

        let marked = anyhow::Error::new(Unrecoverable::new("gone")).context("sending email");
        assert!(ExecutionError::Handler(marked).is_terminal());
    }

    #[test]
    fn programming_errors_are_terminal() {
        assert!(ExecutionError::UnknownJobType("Missing".into()).is_terminal());
        assert!(!ExecutionError::Timeout(Duration::from_secs(1)).is_terminal());
        assert!(!ExecutionError::Panicked("boom".into()).is_terminal());
    }

    #[test]
    fn pool_exhaustion_is_a_connection_error() {
        assert!(BrokerError::from(sqlx::Error::PoolTimedOut).is_connection());
        assert!(!BrokerError::from(sqlx::Error::RowNotFound).is_connection());
    }
}
