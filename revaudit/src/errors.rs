use thiserror::Error as ThisError;

/// Result type for revaudit operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid input supplied by the caller
    #[error("{message}")]
    BadRequest { message: String },

    /// Upstream rejected the call for exceeding its rate limit
    #[error("Throttled by upstream, retry after {retry_after_seconds:.1}s")]
    Throttled { retry_after_seconds: f64 },

    /// Network-level failure or upstream server error
    #[error("Transport failure: {message}")]
    Transport { message: String },

    /// A single call exceeded its timeout
    #[error("Request timed out: {operation}")]
    Timeout { operation: String },

    /// Requested resource does not exist upstream
    #[error("{resource} '{id}' not found")]
    NotFound { resource: String, id: String },

    /// Upstream refused the request as permanently invalid
    #[error("Upstream rejected request ({status}): {message}")]
    InvalidRequest { status: u16, message: String },

    /// The API credential was rejected
    #[error("Credential rejected by upstream ({status})")]
    Unauthorized { status: u16 },

    /// Response body did not have the expected structure
    #[error("Malformed upstream response: {message}")]
    MalformedResponse { message: String },

    /// The run was cancelled before this operation finished
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the transport layer may retry the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Throttled { .. } | Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Whether this error must abort the whole extraction run rather than degrade one task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedResponse { message: message.into() }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout {
                operation: e.url().map(|u| u.path().to_string()).unwrap_or_else(|| "request".to_string()),
            }
        } else {
            Error::Transport { message: e.to_string() }
        }
    }
}
