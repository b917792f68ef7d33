use std::time::Duration;

use thiserror::Error;

use crate::datastore::DatastoreError;

/// Failure taxonomy for the execution runtime.
///
/// `Abort` is terminal and bypasses self-healing; everything else is a
/// candidate for repair within the retry budget.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("API call failed with status {status}: {message}")]
    ApiCall {
        status: u16,
        message: String,
        /// The failing configuration with credential values masked.
        masked_config: Option<serde_json::Value>,
    },

    #[error("aborted: {0}")]
    Abort(String),

    #[error("pagination parameters are not varying: {0}")]
    PaginationConfig(String),

    #[error("stop condition never fired on an empty response: {0}")]
    StopCondition(String),

    #[error("Received HTML response instead of data: {0}")]
    HtmlResponse(String),

    #[error("rate limit exceeded; server asked to wait {wait_secs}s which exceeds the budget")]
    RateLimitExceeded { wait_secs: u64 },

    #[error("OAuth token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("expression evaluation failed: {0}")]
    Expression(String),

    #[error("postgres call failed: {0}")]
    Postgres(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl EngineError {
    /// Errors that the self-healing coordinator must not attempt to repair.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Abort(_) | EngineError::Datastore(_) | EngineError::Timeout(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            EngineError::ApiCall { status, .. } => Some(*status),
            EngineError::RateLimitExceeded { .. } => Some(429),
            _ => None,
        }
    }
}
