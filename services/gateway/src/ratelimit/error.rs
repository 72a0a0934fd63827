use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend error: {0}")]
    Backend(String),
    #[error("rate limit backend misconfigured: {0}")]
    Config(String),
    #[error("rate limit backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("bucket {key} kept changing after {attempts} attempts")]
    Contention { key: String, attempts: u32 },
    #[error("bucket state could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}
