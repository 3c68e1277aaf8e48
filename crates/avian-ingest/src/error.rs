//! Error taxonomy for ingestion
//!
//! - [`TransportError`]: outcome of one remote operation. `Transient` is
//!   retried inside the transport, `Terminal` and `Exhausted` abort the step.
//! - [`TransformError`]: a record whose shape does not match what the
//!   transform expects. Counted as a rejection, never aborts a run.
//! - [`IngestError`]: everything else that can stop a connect, fetch or load.

use std::time::Duration;
use thiserror::Error;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Classified failure of a single remote operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        /// Server-supplied delay (e.g. `Retry-After`), preferred over backoff
        retry_after: Option<Duration>,
    },

    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        TransportError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        TransportError::Transient {
            message: message.into(),
            retry_after,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        TransportError::Terminal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() || err.is_redirect() {
            return TransportError::terminal(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_client_error() && status.as_u16() != 429 => {
                TransportError::terminal(err.to_string())
            },
            // timeouts, refused connections, truncated bodies, 5xx
            _ => TransportError::transient(err.to_string()),
        }
    }
}

/// A record that passed validation but could not be mapped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("field '{field}': {message}")]
pub struct TransformError {
    pub field: String,
    pub message: String,
}

impl TransformError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "missing")
    }
}

/// Error types for ingestion steps
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("connection to {source_id} failed: {reason}")]
    Connect { source_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Common(#[from] avian_common::AvianError),

    #[error("Invalid input: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn connect(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Connect {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }
}
