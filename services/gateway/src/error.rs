use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::context;
use crate::route::RouteError;
use crate::tenant::TenantError;

/// Outcome of the admission pipeline that stops a request before it reaches
/// its handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("no tenant is configured for {0}")]
    UnknownTenant(String),

    #[error("tenant {0} is under maintenance")]
    Maintenance(String),

    #[error("tenant {0} is read-only")]
    ReadOnly(String),

    #[error("too many requests, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("no route matches {0}")]
    RouteNotFound(String),

    #[error("insufficient role to access {0}")]
    Forbidden(String),

    #[error("service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
}

impl AdmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdmissionError::UnknownTenant(_) | AdmissionError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            AdmissionError::Maintenance(_) | AdmissionError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdmissionError::ReadOnly(_) | AdmissionError::Forbidden(_) => StatusCode::FORBIDDEN,
            AdmissionError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AdmissionError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::UnknownTenant(_) => "TENANT_NOT_FOUND",
            AdmissionError::Maintenance(_) => "TENANT_MAINTENANCE",
            AdmissionError::ReadOnly(_) => "TENANT_READ_ONLY",
            AdmissionError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            AdmissionError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            AdmissionError::Forbidden(_) => "INSUFFICIENT_ROLE",
            AdmissionError::Unavailable(_) => "BACKING_STORE_UNAVAILABLE",
            AdmissionError::Upstream(_) => "UPSTREAM_ERROR",
            AdmissionError::BadRequest(_) => "BAD_REQUEST",
            AdmissionError::BodyTooLarge { .. } => "BODY_TOO_LARGE",
        }
    }

    pub fn to_response(&self, request_id: Option<&str>) -> Response {
        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
            "request_id": request_id,
        });

        let mut response = match self {
            AdmissionError::RateLimited { retry_after_secs } => {
                body["wait_seconds"] = json!(retry_after_secs);
                let mut response = (self.status(), Json(body)).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                response
            }
            _ => (self.status(), Json(body)).into_response(),
        };
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let request_id = context::trace_id();
        self.to_response(request_id.as_deref())
    }
}

impl From<TenantError> for AdmissionError {
    fn from(err: TenantError) -> Self {
        match err {
            TenantError::UnknownTenant(host) => AdmissionError::UnknownTenant(host),
            other => AdmissionError::Unavailable(other.to_string()),
        }
    }
}

impl From<RouteError> for AdmissionError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NotFound(path) => AdmissionError::RouteNotFound(path),
            RouteError::Inaccessible(id) => AdmissionError::RouteNotFound(format!("route {id}")),
            RouteError::Forbidden { route_id, .. } => AdmissionError::Forbidden(format!("route {route_id}")),
            RouteError::BackingStoreUnavailable(reason) => AdmissionError::Unavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = AdmissionError::RateLimited { retry_after_secs: 7 }.to_response(Some("abc"));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn tenant_errors_map_to_status() {
        assert_eq!(
            AdmissionError::from(TenantError::UnknownTenant("x.com".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AdmissionError::from(TenantError::BackingStoreUnavailable("down".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn route_gates_map_to_not_found_and_forbidden() {
        assert_eq!(
            AdmissionError::from(RouteError::Inaccessible(4)).code(),
            "ROUTE_NOT_FOUND"
        );
        assert_eq!(
            AdmissionError::from(RouteError::Forbidden {
                route_id: 4,
                required: vec!["ROLE_MEMBER".into()]
            })
            .status(),
            StatusCode::FORBIDDEN
        );
    }
}
