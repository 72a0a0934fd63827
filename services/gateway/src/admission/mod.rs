//! Axum middleware chain applied to every request, outermost first:
//! [`correlate`] → [`resolve_tenant`] → [`rate_limit`] → [`route_gates`] →
//! [`sanitize_input`]. Requests that clear every stage reach the API routes
//! or [`forward`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, field, info_span, warn, Instrument, Span};

use crate::api::ApiState;
use crate::context::{self, resolve_locale, resolve_trace_id, Channel, RequestContext};
use crate::error::AdmissionError;
use crate::route::{check_accessible, check_read_access, RouteError};

pub mod exclusion;
pub mod upstream;
pub mod xss;

pub use exclusion::PathExclusions;
pub use upstream::UpstreamClient;
pub use xss::XssSanitizer;

pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-rate-limit-remaining";

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Binds the correlation id, locale and channel for the rest of the chain
/// and echoes the correlation id on the response.
pub async fn correlate(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let trace_id = resolve_trace_id(header_str(headers, &state.correlation_header));
    let locale = resolve_locale(
        header_str(headers, &header::ACCEPT_LANGUAGE),
        &state.config.context.default_locale,
    );
    let channel = state.channels.classify(request.uri().path());

    let span = info_span!(
        "request",
        trace_id = %trace_id,
        tenant_id = field::Empty,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let context = RequestContext::new(trace_id.clone(), locale, channel);

    let mut response = context::scope(context, next.run(request))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(state.correlation_header.clone(), value);
    }
    response
}

/// Resolves the tenant from the host (or the override header), loads its
/// metadata and enforces maintenance and read-only modes.
pub async fn resolve_tenant(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.exclusions.is_excluded(request.uri().path()) {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default()
        .to_string();

    let resolved = state
        .tenants
        .resolve(&host, header_str(request.headers(), &state.override_header));
    let tenant_id = match resolved {
        Ok(tenant_id) => tenant_id,
        Err(err) => {
            debug!(host = %host, error = %err, "tenant resolution failed");
            return AdmissionError::from(err).into_response();
        }
    };

    let metadata = match state.metadata.get(&tenant_id).await {
        Ok(metadata) => metadata,
        Err(err) => return AdmissionError::from(err).into_response(),
    };
    Span::current().record("tenant_id", tenant_id.as_str());

    if metadata.maintenance_mode {
        return AdmissionError::Maintenance(tenant_id).into_response();
    }
    if metadata.read_only_mode && !is_safe_method(request.method()) {
        return AdmissionError::ReadOnly(tenant_id).into_response();
    }

    let context = match context::current() {
        Some(current) => current.with_tenant(metadata),
        None => RequestContext::new(
            resolve_trace_id(None),
            state.config.context.default_locale.clone(),
            state.channels.classify(request.uri().path()),
        )
        .with_tenant(metadata),
    };
    context::scope(context, next.run(request)).await
}

/// Consumes one token for the request's `tenant:client:route` bucket.
pub async fn rate_limit(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let tenant = context::current().and_then(|context| {
        context
            .tenant
            .as_ref()
            .map(|tenant| tenant.tenant_id.clone())
    });
    let peer = peer_addr(&request).unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let (parts, body) = request.into_parts();
    let outcome = state
        .rate_limiter
        .check(
            tenant.as_deref(),
            &parts.method,
            parts.uri.path(),
            peer,
            &parts.headers,
        )
        .await;
    let request = Request::from_parts(parts, body);

    match outcome {
        None => next.run(request).await,
        Some(outcome) if !outcome.allowed => {
            warn!(
                tenant_id = tenant.as_deref().unwrap_or_default(),
                client_ip = %peer.ip(),
                path = %request.uri().path(),
                retry_after_secs = outcome.retry_after_secs,
                "request throttled"
            );
            AdmissionError::RateLimited {
                retry_after_secs: outcome.retry_after_secs,
            }
            .into_response()
        }
        Some(outcome) => {
            let mut response = next.run(request).await;
            if !outcome.failed_open {
                response.headers_mut().insert(
                    RATE_LIMIT_REMAINING_HEADER,
                    HeaderValue::from(outcome.remaining_tokens),
                );
            }
            response
        }
    }
}

/// Resolves the route rule for tenant-bound requests and applies the
/// accessibility and read-role gates. Paths no rule covers pass through
/// without a route.
pub async fn route_gates(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(current) = context::current() else {
        return next.run(request).await;
    };
    let Some(tenant) = current.tenant.as_ref() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    let rule = match state.routes.resolve(&tenant.tenant_id, &path).await {
        Ok(rule) => rule,
        Err(RouteError::NotFound(_)) => return next.run(request).await,
        Err(err) => return AdmissionError::from(err).into_response(),
    };

    let principal = state
        .access
        .principal(request.headers(), request.extensions());
    let gates = check_accessible(&rule).and_then(|_| check_read_access(&rule, principal.as_ref()));
    if let Err(err) = gates {
        debug!(
            route_id = rule.id,
            principal = principal.as_ref().map(|p| p.id.as_str()).unwrap_or("anonymous"),
            error = %err,
            "route gate rejected request"
        );
        return AdmissionError::from(err).into_response();
    }

    context::scope(current.with_route(rule), next.run(request)).await
}

/// Strips markup from form and JSON bodies of state-changing requests before
/// any handler or the upstream reads them.
pub async fn sanitize_input(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    let kind = state.xss.body_kind(
        request.method(),
        request.uri().path(),
        header_str(request.headers(), &header::CONTENT_TYPE),
    );
    let Some(kind) = kind else {
        return next.run(request).await;
    };

    let limit = state.config.max_body_size_bytes;
    let (mut parts, body) = request.into_parts();
    let bytes = match to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(_) => return AdmissionError::BodyTooLarge { limit }.into_response(),
    };

    let body = match state.xss.clean(kind, parts.uri.path(), &bytes) {
        Some(cleaned) => {
            debug!(
                path = %parts.uri.path(),
                received = bytes.len(),
                forwarded = cleaned.len(),
                "stripped markup from request body"
            );
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(cleaned.len()));
            Body::from(cleaned)
        }
        None => Body::from(bytes),
    };
    next.run(Request::from_parts(parts, body)).await
}

#[derive(Debug, Serialize)]
pub struct AdmittedRequest {
    pub admitted: bool,
    pub trace_id: Option<String>,
    pub tenant_id: Option<String>,
    pub channel: Channel,
    pub locale: Option<String>,
    pub route_id: Option<u64>,
    pub view_name: Option<String>,
}

impl AdmittedRequest {
    fn from_context(context: Option<&RequestContext>) -> Self {
        Self {
            admitted: true,
            trace_id: context.map(|c| c.trace_id.clone()),
            tenant_id: context
                .and_then(|c| c.tenant.as_ref())
                .map(|t| t.tenant_id.clone()),
            channel: context.map(|c| c.channel).unwrap_or(Channel::Unknown),
            locale: context.map(|c| c.locale.clone()),
            route_id: context.and_then(|c| c.route.as_ref()).map(|r| r.id),
            view_name: context.and_then(RequestContext::view_name),
        }
    }
}

/// Terminal handler for admitted requests without an API route: forwards to
/// the configured upstream, or describes the admission outcome when none is
/// configured.
pub async fn forward(State(state): State<Arc<ApiState>>, request: Request) -> Response {
    let context = context::current();
    match &state.upstream {
        Some(upstream) => {
            let peer = peer_addr(&request);
            match upstream.forward(request, context.as_deref(), peer).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "upstream forwarding failed");
                    err.into_response()
                }
            }
        }
        None => Json(AdmittedRequest::from_context(context.as_deref())).into_response(),
    }
}
