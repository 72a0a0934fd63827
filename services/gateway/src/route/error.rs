use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route matches {0}")]
    NotFound(String),
    #[error("route {0} is not accessible")]
    Inaccessible(u64),
    #[error("route {route_id} requires one of the roles {required:?}")]
    Forbidden { route_id: u64, required: Vec<String> },
    #[error("route store unavailable: {0}")]
    BackingStoreUnavailable(String),
}
