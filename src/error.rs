//! Error types and handling for Gridwise
//!
//! This module defines the error types used throughout the application. The
//! variants split into two groups: transient upstream failures that the
//! controller loop backs off from, and configuration or data-coverage failures
//! that abort the current tick without being retried.

use thiserror::Error;

/// Result type alias for Gridwise operations
pub type Result<T> = std::result::Result<T, GridwiseError>;

/// Main error type for Gridwise
#[derive(Debug, Error)]
pub enum GridwiseError {
    /// Configuration file errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A caller asked for something that can never succeed (bad forecast
    /// window, bad bucket size, unsupported price resolution)
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Requested control mode is not one the plant understands
    #[error("Invalid control mode: '{mode}'")]
    InvalidMode { mode: String },

    /// Historical data does not cover every slot needed for a forecast
    #[error("Insufficient history: {message}")]
    InsufficientHistory { message: String },

    /// Network or API failure of a collaborator
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },

    /// Rate limit still in force after the client gave up retrying
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Upstream answered but the payload was unusable
    #[error("API error: {message}")]
    Api { message: String },

    /// Authentication/authorization errors
    #[error("Authentication error: {message}")]
    Auth { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl GridwiseError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        GridwiseError::Config {
            message: message.into(),
        }
    }

    /// Create a new invalid-configuration error
    pub fn invalid_configuration<S: Into<String>>(message: S) -> Self {
        GridwiseError::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create a new invalid-mode error
    pub fn invalid_mode<S: Into<String>>(mode: S) -> Self {
        GridwiseError::InvalidMode { mode: mode.into() }
    }

    /// Create a new insufficient-history error
    pub fn insufficient_history<S: Into<String>>(message: S) -> Self {
        GridwiseError::InsufficientHistory {
            message: message.into(),
        }
    }

    /// Create a new upstream-unavailable error
    pub fn network<S: Into<String>>(message: S) -> Self {
        GridwiseError::UpstreamUnavailable {
            message: message.into(),
        }
    }

    /// Create a new rate-limited error
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        GridwiseError::RateLimited { retry_after_secs }
    }

    /// Create a new API error
    pub fn api<S: Into<String>>(message: S) -> Self {
        GridwiseError::Api {
            message: message.into(),
        }
    }

    /// Create a new auth error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        GridwiseError::Auth {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        GridwiseError::Io {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        GridwiseError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        GridwiseError::Timeout {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        GridwiseError::Generic {
            message: message.into(),
        }
    }

    /// Whether the failure is worth a fixed backoff and retry.
    ///
    /// Configuration and data-coverage failures are not: retrying them sooner
    /// than the next scheduled wake only repeats the same outcome.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GridwiseError::UpstreamUnavailable { .. }
                | GridwiseError::RateLimited { .. }
                | GridwiseError::Api { .. }
                | GridwiseError::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for GridwiseError {
    fn from(err: std::io::Error) -> Self {
        GridwiseError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for GridwiseError {
    fn from(err: serde_yaml::Error) -> Self {
        GridwiseError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GridwiseError {
    fn from(err: serde_json::Error) -> Self {
        GridwiseError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GridwiseError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GridwiseError::timeout(err.to_string())
        } else if err.is_decode() {
            GridwiseError::api(err.to_string())
        } else {
            GridwiseError::network(err.to_string())
        }
    }
}

impl From<chrono::ParseError> for GridwiseError {
    fn from(err: chrono::ParseError) -> Self {
        GridwiseError::validation("datetime", err.to_string().as_str())
    }
}
