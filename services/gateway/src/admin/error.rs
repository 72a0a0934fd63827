use cms_pattern_match::PatternError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("invalid domain pattern: {0}")]
    Pattern(#[from] PatternError),
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for AdminError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(what) => AdminError::Conflict(what),
            StoreError::NotFound(what) => AdminError::NotFound(what),
            other => AdminError::Store(other),
        }
    }
}
