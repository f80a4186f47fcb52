use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed: code={code}, reason={reason}")]
    Closed { code: u16, reason: String },

    #[error("no traffic for {0}s")]
    HeartbeatTimeout(u64),

    #[error("gave up after {attempts} reconnection attempts")]
    Exhausted { attempts: u32 },

    #[error("decrypt failed: {0}")]
    Decrypt(String),

    #[error("unparseable frame: {0}")]
    Parse(String),

    #[error("websocket error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type FeedResult<T> = Result<T, FeedError>;
