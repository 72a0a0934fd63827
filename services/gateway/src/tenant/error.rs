use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TenantError {
    /// No rule matches the host, or no metadata exists for the tenant id.
    #[error("unknown tenant: {0}")]
    UnknownTenant(String),
    #[error("tenant store unavailable: {0}")]
    BackingStoreUnavailable(String),
    #[error("tenant store did not answer within {0:?}")]
    Timeout(Duration),
}
