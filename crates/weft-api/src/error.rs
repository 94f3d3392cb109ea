//! Error types for weft-api

use thiserror::Error;

/// Result type alias using weft-api Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the conversation backend
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend answered with a non-success status code
    #[error("Backend error: {message} (status: {status})")]
    Api { status: u16, message: String },

    /// Submit response did not carry a conversation id
    #[error("Response is missing a conversation id")]
    MissingConversationId,

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Create a backend error from a status code and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying on a later poll
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) => true,
            Error::Api { status, message } => {
                let msg = message.to_lowercase();
                *status == 429
                    || *status == 408
                    || (500..600).contains(status)
                    || msg.contains("overloaded")
                    || msg.contains("try again")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_server_errors() {
        assert!(Error::api(500, "internal").is_retryable());
        assert!(Error::api(503, "unavailable").is_retryable());
        assert!(Error::api(429, "slow down").is_retryable());
        assert!(Error::api(408, "request timeout").is_retryable());
    }

    #[test]
    fn test_retryable_message_hint() {
        assert!(Error::api(400, "Backend overloaded, try again").is_retryable());
    }

    #[test]
    fn test_not_retryable_client_errors() {
        assert!(!Error::api(400, "bad query").is_retryable());
        assert!(!Error::api(404, "unknown conversation").is_retryable());
    }

    #[test]
    fn test_not_retryable_correlation_errors() {
        assert!(!Error::MissingConversationId.is_retryable());
        assert!(!Error::InvalidConfig("empty base url".into()).is_retryable());
        assert!(!Error::UnexpectedResponse("html".into()).is_retryable());
    }
}
