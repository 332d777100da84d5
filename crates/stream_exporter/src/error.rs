//! Error types for stream export operations.

use thiserror::Error;

/// Errors returned by a [`StreamClient`](crate::client::StreamClient).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport-layer failure (connect, timeout, reset)
    #[error("transport error: {0}")]
    Transport(String),
    /// The store answered with an error status
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// An event could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The stream name cannot be placed in a request URL
    #[error("invalid stream name: {0}")]
    InvalidStreamName(String),
    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,
    /// All retry attempts failed
    #[error("all retry attempts exhausted after {attempts} tries: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClientError> },
}

impl ClientError {
    /// Transport failures and server-side (5xx) statuses are worth retrying.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this error came from cancellation rather than failure.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Errors raised while validating an [`ExporterConfig`](crate::config::ExporterConfig).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("endpoint is required")]
    MissingEndpoint,
    #[error("api_key is required")]
    MissingApiKey,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Errors raised while constructing a [`StreamExporter`](crate::exporter::StreamExporter).
#[derive(Debug, Error)]
pub enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The exporter spawns its flush tasks on the current Tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

/// Errors returned when queueing an event on a [`QueuedWriter`](crate::writer::QueuedWriter).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// The queue is at capacity; the event was not accepted.
    #[error("write queue is full")]
    Full,
    /// The writer has been closed.
    #[error("writer is closed")]
    Closed,
}
