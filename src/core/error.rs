use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Remote endpoint could not be reached (refused, reset, timed out).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Remote endpoint answered, but with something we cannot use.
    #[error("Protocol error: {message} ({context})")]
    Protocol { message: String, context: String },

    #[error("Discovery canceled")]
    Canceled,

    #[error("Ambiguous match for resource '{uri}': {candidates} candidates")]
    AmbiguousMatch { uri: String, candidates: usize },

    #[error("Write-write conflict detected: {0}")]
    WriteConflict(String),

    #[error("Transaction exceeded access timeout of {0:?}")]
    TransactionTimeout(Duration),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Service identity changed: expected {expected}, got {actual}")]
    IdentityMismatch { expected: Uuid, actual: Uuid },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl DiscoveryError {
    pub fn protocol(message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Only write-write conflicts are worth replaying the whole unit of work for.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for DiscoveryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Storage(err.to_string())
    }
}
