use std::time::Duration;

/// Error taxonomy for the orchestration layer.
///
/// Adapters always fail with one of these variants so the orchestrator can
/// decide whether to retry the same provider, fail over, or give up.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Request must contain at least one message")]
    EmptyRequest,

    #[error("No providers available")]
    NoProviders,

    #[error("All providers failed after {attempts} attempt(s); last error: {last}")]
    AllProvidersFailed { attempts: usize, last: Box<AiError> },
}

impl AiError {
    /// Classify a non-2xx vendor response. Every adapter routes HTTP
    /// failures through here so status mapping stays uniform.
    pub fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => AiError::Authentication(message),
            429 => AiError::RateLimited {
                message,
                retry_after,
            },
            _ => AiError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        AiError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AiError>;
