use serde::{Deserialize, Serialize};

use crate::session::SessionRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRequest {
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub rules: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReorderRoutesRequest {
    pub ids: Vec<u64>,
}

/// Either `key` (one bucket) or `tenant_id` (every bucket of the tenant).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetRateLimitRequest {
    pub tenant_id: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetRateLimitResponse {
    pub removed: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionQuery {
    pub identity: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrincipalSessions {
    pub identity: String,
    pub tenant_id: String,
    pub sessions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionsResponse {
    pub total: usize,
    pub principals: Vec<PrincipalSessions>,
    /// Populated when the query names a single principal.
    pub sessions: Vec<SessionRecord>,
}
