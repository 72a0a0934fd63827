use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{Extensions, HeaderMap, StatusCode},
    Json,
};
use serde_json::json;
use tracing::{debug, error, info};

use crate::admin::{AdminError, CreateTenant, UpdateTenant};
use crate::context;
use crate::route::{AccessContext, NewRouteRule, Principal, RouteRule};
use crate::session::{Authentication, PrincipalKey, SessionError, SessionGrant, SessionRecord};
use crate::store::StoreError;
use crate::tenant::{TenantMetadata, TenantRule};

use super::types::{
    DomainRequest, ErrorResponse, PrincipalSessions, RefreshResponse,
    ReorderRoutesRequest, ResetRateLimitRequest, ResetRateLimitResponse, SessionQuery,
    SessionsResponse, SuccessResponse,
};
use super::ApiState;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health_check(State(state): State<Arc<ApiState>>) -> ApiResult<serde_json::Value> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "cms-admission-gateway",
        "tenant_rules": state.tenants.rule_count(),
        "rate_limit_backend": state.rate_limiter.backend_name(),
        "active_sessions": state.sessions.registry().session_count(),
    })))
}

// Tenants

pub async fn list_tenant_rules(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<TenantRule>> {
    let rules = state.tenant_admin.list_rules().await.map_err(admin_error)?;
    Ok(Json(rules))
}

pub async fn refresh_tenant_rules(State(state): State<Arc<ApiState>>) -> ApiResult<RefreshResponse> {
    match state.tenants.refresh().await {
        Ok(rules) => Ok(Json(RefreshResponse { rules })),
        Err(err) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "BACKING_STORE_UNAVAILABLE",
            err.to_string(),
        )),
    }
}

pub async fn create_tenant(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<CreateTenant>,
) -> ApiResult<TenantMetadata> {
    let created = state.tenant_admin.create(request).await.map_err(admin_error)?;
    Ok(Json(created))
}

pub async fn get_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<TenantMetadata> {
    let metadata = state.tenant_admin.get(&tenant_id).await.map_err(admin_error)?;
    Ok(Json(metadata))
}

pub async fn update_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
    Json(update): Json<UpdateTenant>,
) -> ApiResult<TenantMetadata> {
    let updated = state
        .tenant_admin
        .update(&tenant_id, update)
        .await
        .map_err(admin_error)?;
    Ok(Json(updated))
}

pub async fn delete_tenant(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<SuccessResponse> {
    state.tenant_admin.delete(&tenant_id).await.map_err(admin_error)?;

    // Prefix deletes scan the bucket store; the response does not wait on them.
    let rate_limiter = Arc::clone(&state.rate_limiter);
    context::spawn_with_context(async move {
        match rate_limiter.reset_tenant(&tenant_id).await {
            Ok(removed) => debug!(tenant_id = %tenant_id, removed, "dropped rate limit buckets of deleted tenant"),
            Err(err) => {
                error!(tenant_id = %tenant_id, error = %err, "failed to drop rate limit buckets of deleted tenant")
            }
        }
    });
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn add_domain(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
    Json(request): Json<DomainRequest>,
) -> ApiResult<TenantRule> {
    let rule = state
        .tenant_admin
        .add_domain(&tenant_id, &request.domain)
        .await
        .map_err(admin_error)?;
    Ok(Json(rule))
}

pub async fn replace_domain(
    State(state): State<Arc<ApiState>>,
    Path(pattern): Path<String>,
    Json(request): Json<DomainRequest>,
) -> ApiResult<TenantRule> {
    let rule = state
        .tenant_admin
        .replace_domain(&pattern, &request.domain)
        .await
        .map_err(admin_error)?;
    Ok(Json(rule))
}

pub async fn remove_domain(
    State(state): State<Arc<ApiState>>,
    Path(pattern): Path<String>,
) -> ApiResult<TenantRule> {
    let rule = state
        .tenant_admin
        .remove_domain(&pattern)
        .await
        .map_err(admin_error)?;
    Ok(Json(rule))
}

/// Drops the cached metadata and route table of one tenant.
pub async fn evict_tenant_caches(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<SuccessResponse> {
    state.metadata.evict(&tenant_id);
    state.routes.invalidate(&tenant_id);
    info!(tenant_id = %tenant_id, "tenant caches evicted");
    Ok(Json(SuccessResponse { success: true }))
}

// Routes

pub async fn list_routes(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Vec<RouteRule>> {
    let rules = state.route_admin.list(&tenant_id).await.map_err(admin_error)?;
    Ok(Json(rules))
}

pub async fn create_route(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
    Json(rule): Json<NewRouteRule>,
) -> ApiResult<RouteRule> {
    let created = state
        .route_admin
        .create(&tenant_id, rule)
        .await
        .map_err(admin_error)?;
    Ok(Json(created))
}

pub async fn update_route(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, route_id)): Path<(String, u64)>,
    Json(rule): Json<NewRouteRule>,
) -> ApiResult<RouteRule> {
    let updated = state
        .route_admin
        .update(&tenant_id, route_id, rule)
        .await
        .map_err(admin_error)?;
    Ok(Json(updated))
}

pub async fn delete_route(
    State(state): State<Arc<ApiState>>,
    Path((tenant_id, route_id)): Path<(String, u64)>,
) -> ApiResult<SuccessResponse> {
    state
        .route_admin
        .delete(&tenant_id, route_id)
        .await
        .map_err(admin_error)?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn reorder_routes(
    State(state): State<Arc<ApiState>>,
    Path(tenant_id): Path<String>,
    Json(request): Json<ReorderRoutesRequest>,
) -> ApiResult<Vec<RouteRule>> {
    let rules = state
        .route_admin
        .reorder(&tenant_id, &request.ids)
        .await
        .map_err(admin_error)?;
    Ok(Json(rules))
}

// Rate limits

pub async fn reset_rate_limits(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ResetRateLimitRequest>,
) -> ApiResult<ResetRateLimitResponse> {
    let removed = match (&request.key, &request.tenant_id) {
        (Some(key), _) => state.rate_limiter.reset_key(key).await.map(|_| 1),
        (None, Some(tenant_id)) => state.rate_limiter.reset_tenant(tenant_id).await,
        (None, None) => {
            return Err(bad_request("INVALID_REQUEST", "either key or tenant_id is required"));
        }
    }
    .map_err(|err| {
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "RATE_LIMIT_BACKEND_UNAVAILABLE",
            err.to_string(),
        )
    })?;

    info!(
        key = request.key.as_deref().unwrap_or_default(),
        tenant_id = request.tenant_id.as_deref().unwrap_or_default(),
        removed,
        "rate limit buckets reset"
    );
    Ok(Json(ResetRateLimitResponse { removed }))
}

// Sessions

pub async fn list_sessions(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<SessionsResponse> {
    let registry = state.sessions.registry();
    let mut principals: Vec<PrincipalSessions> = registry
        .summary()
        .into_iter()
        .filter(|(key, _)| {
            query.tenant_id.as_deref().map_or(true, |t| key.tenant_id == t)
                && query.identity.as_deref().map_or(true, |i| key.identity == i)
        })
        .map(|(key, sessions)| PrincipalSessions {
            identity: key.identity,
            tenant_id: key.tenant_id,
            sessions,
        })
        .collect();
    principals.sort_by(|a, b| (&a.tenant_id, &a.identity).cmp(&(&b.tenant_id, &b.identity)));

    let sessions = match (query.identity, query.tenant_id) {
        (Some(identity), Some(tenant_id)) => {
            registry.sessions_for(&PrincipalKey::new(identity, tenant_id))
        }
        _ => Vec::new(),
    };

    Ok(Json(SessionsResponse {
        total: principals.iter().map(|p| p.sessions).sum(),
        principals,
        sessions,
    }))
}

/// Registers a session for the authenticated caller. Identity and roles come
/// from the access context only; a request body is ignored.
pub async fn create_session(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    extensions: Extensions,
) -> ApiResult<SessionGrant> {
    let principal = authenticated(&state, &headers, &extensions)?;
    let tenant_id = bound_tenant()?;

    let auth = Authentication {
        identity: principal.id,
        tenant_id,
        roles: principal.roles.into_iter().collect(),
    };
    let grant = state
        .sessions
        .on_authenticated(&auth)
        .map_err(session_error)?;
    Ok(Json(grant))
}

pub async fn touch_session(
    State(state): State<Arc<ApiState>>,
    Path(handle): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> ApiResult<SessionRecord> {
    let principal = authenticated(&state, &headers, &extensions)?;
    owned_session(&state, &principal, &handle)?;
    let record = state
        .sessions
        .registry()
        .touch(&handle)
        .map_err(session_error)?;
    Ok(Json(record))
}

pub async fn end_session(
    State(state): State<Arc<ApiState>>,
    Path(handle): Path<String>,
    headers: HeaderMap,
    extensions: Extensions,
) -> ApiResult<SessionRecord> {
    let principal = authenticated(&state, &headers, &extensions)?;
    owned_session(&state, &principal, &handle)?;
    let record = state
        .sessions
        .registry()
        .remove(&handle)
        .map_err(session_error)?;
    Ok(Json(record))
}

fn authenticated(
    state: &ApiState,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Result<Principal, ApiError> {
    state.access.principal(headers, extensions).ok_or_else(|| {
        error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHENTICATED",
            "no authenticated principal on this request",
        )
    })
}

fn bound_tenant() -> Result<String, ApiError> {
    context::current()
        .and_then(|context| context.tenant.as_ref().map(|t| t.tenant_id.clone()))
        .ok_or_else(|| bad_request("TENANT_REQUIRED", "no tenant is bound to this request"))
}

/// Sessions are only visible to their own principal, through the tenant they
/// were created in.
fn owned_session(state: &ApiState, principal: &Principal, handle: &str) -> Result<SessionRecord, ApiError> {
    let tenant_id = bound_tenant()?;
    match state.sessions.registry().get(handle) {
        Some(record)
            if record.principal.tenant_id == tenant_id && record.principal.identity == principal.id =>
        {
            Ok(record)
        }
        _ => Err(session_error(SessionError::UnknownSession(handle.to_string()))),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.into(),
            request_id: context::trace_id(),
        }),
    )
}

fn bad_request(code: &str, message: &str) -> ApiError {
    error_response(StatusCode::BAD_REQUEST, code, message)
}

fn admin_error(err: AdminError) -> ApiError {
    match err {
        AdminError::Validation(_) | AdminError::Pattern(_) => {
            error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", err.to_string())
        }
        AdminError::Conflict(_) => error_response(StatusCode::CONFLICT, "CONFLICT", err.to_string()),
        AdminError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string()),
        AdminError::Forbidden(_) => {
            error_response(StatusCode::FORBIDDEN, "TENANT_MISMATCH", err.to_string())
        }
        AdminError::Store(StoreError::Unavailable(_)) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "BACKING_STORE_UNAVAILABLE",
            err.to_string(),
        ),
        AdminError::Store(_) => {
            error!(error = %err, "admin API internal error");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "internal server error",
            )
        }
    }
}

fn session_error(err: SessionError) -> ApiError {
    match err {
        SessionError::MaximumExceeded { .. } => error_response(
            StatusCode::CONFLICT,
            "MAXIMUM_SESSIONS_EXCEEDED",
            err.to_string(),
        ),
        SessionError::UnknownSession(_) => {
            error_response(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", err.to_string())
        }
    }
}
