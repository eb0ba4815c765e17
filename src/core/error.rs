//! Error type system for the source runtime
//!
//! Every public operation of the runtime reports failures through [`TingError`].
//! The variants follow one taxonomy regardless of where a failure originated:
//! - `NetworkError` for connection problems, timeouts and HTTP status failures
//! - `ScriptError` for anything thrown or rejected inside a source script
//! - `ParseError` for script output that cannot be lifted into domain types
//! - `InstallError` for catalog download and package failures
//! - `NotFound` for missing packages and unknown source ids

use serde::{Deserialize, Serialize};

/// Main error type for the source runtime
#[derive(Debug, thiserror::Error)]
pub enum TingError {
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// HTTP status when the server answered with a failure code
        status: Option<u16>,
        /// Whether the request gave up waiting
        timed_out: bool,
    },

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Install error: {0}")]
    InstallError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl TingError {
    /// Network failure without an HTTP status
    pub fn network(message: impl Into<String>) -> Self {
        TingError::NetworkError {
            message: message.into(),
            status: None,
            timed_out: false,
        }
    }

    /// Network failure caused by an exhausted time budget
    pub fn network_timeout(message: impl Into<String>) -> Self {
        TingError::NetworkError {
            message: message.into(),
            status: None,
            timed_out: true,
        }
    }

    /// Server answered with a failure status
    pub fn http_status(status: u16, url: &str) -> Self {
        TingError::NetworkError {
            message: format!("HTTP {} for {}", status, url),
            status: Some(status),
            timed_out: false,
        }
    }

    /// Get the error type name, stable across releases
    pub fn error_type(&self) -> &'static str {
        match self {
            TingError::NetworkError { .. } => "NetworkError",
            TingError::ScriptError(_) => "ScriptError",
            TingError::ParseError(_) => "ParseError",
            TingError::InstallError(_) => "InstallError",
            TingError::NotFound(_) => "NotFound",
            TingError::ConfigError(_) => "ConfigError",
            TingError::DatabaseError(_) => "DatabaseError",
            TingError::IoError(_) => "IoError",
            TingError::SerializationError(_) => "SerializationError",
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            TingError::NetworkError { status, timed_out, .. } => {
                *timed_out || status.map_or(true, |s| s == 429 || s >= 500)
            }
            TingError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// Whether the failure was the remote side not answering in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, TingError::NetworkError { timed_out: true, .. })
    }

    /// HTTP status carried by a network failure
    pub fn status(&self) -> Option<u16> {
        match self {
            TingError::NetworkError { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TingError {
    fn from(err: reqwest::Error) -> Self {
        TingError::NetworkError {
            status: err.status().map(|s| s.as_u16()),
            timed_out: err.is_timeout(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TingError {
    fn from(err: serde_json::Error) -> Self {
        TingError::SerializationError(err.to_string())
    }
}

impl From<r2d2::Error> for TingError {
    fn from(err: r2d2::Error) -> Self {
        TingError::ConfigError(format!("Connection pool error: {}", err))
    }
}

/// Serializable error summary handed to hosts (CLI output, logs, UIs)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&TingError> for ErrorSummary {
    fn from(err: &TingError) -> Self {
        Self {
            error: err.error_type().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Result type alias for operations that can fail with TingError
pub type Result<T> = std::result::Result<T, TingError>;
