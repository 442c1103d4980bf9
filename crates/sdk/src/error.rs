//! Error types for the nvent SDK.

use serde::{Deserialize, Serialize};

/// Result type for SDK operations.
pub type NventResult<T> = Result<T, NventError>;

/// Errors surfaced by the nvent client.
#[derive(Debug, thiserror::Error)]
pub enum NventError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl NventError {
    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Build an API error from a status code and response body.
    pub fn from_response(status: u16, body: &str) -> Self {
        if let Ok(response) = serde_json::from_str::<ErrorResponse>(body) {
            Self::Api {
                status,
                message: response.error,
            }
        } else {
            Self::Api {
                status,
                message: body.to_string(),
            }
        }
    }
}

/// Error payload returned by the nvent API.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
