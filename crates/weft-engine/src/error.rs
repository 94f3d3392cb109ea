//! Error types for weft-engine

use thiserror::Error;

/// Result type alias using weft-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving conversations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the backend client
    #[error(transparent)]
    Api(#[from] weft_api::Error),

    /// The query was rejected before reaching the backend
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl Error {
    /// Check if a later attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if the backend accepted the query without a conversation id
    pub fn is_missing_conversation_id(&self) -> bool {
        matches!(self, Error::Api(weft_api::Error::MissingConversationId))
    }
}
