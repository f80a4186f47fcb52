use thiserror::Error;

/// Failures at the broker REST boundary
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited by broker")]
    RateLimited,

    #[error("broker rejected request [{code}]: {message}")]
    Rejected { code: String, message: String },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("not authenticated: {0}")]
    Auth(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Worth another attempt after a pause
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::RateLimited | GatewayError::Timeout(_) => true,
            GatewayError::Status { status, .. } => *status >= 500,
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
