use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("maximum of {limit} concurrent sessions reached for {identity}")]
    MaximumExceeded { identity: String, limit: usize },
    #[error("session {0} not found")]
    UnknownSession(String),
}
