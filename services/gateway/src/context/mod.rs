//! Request-scoped context available to any code running as part of a request.
//!
//! The context lives in tokio task-local storage. It is bound with [`scope`]
//! for the duration of a future and is gone as soon as that future completes,
//! fails, panics or is dropped. Work moved onto another task does not inherit
//! it; use [`spawn_with_context`] or [`spawn_blocking_with_context`], which
//! capture the current context before the handoff and re-bind it inside the
//! new task.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::route::RouteRule;
use crate::tenant::{TenantMetadata, DEFAULT_TENANT_ID};

pub mod extract;

pub use extract::{resolve_locale, resolve_trace_id, Channel, ChannelPrefixes};

tokio::task_local! {
    static CURRENT: Arc<RequestContext>;
}

/// Snapshot bound for one request. Never mutated; narrower scopes bind a
/// modified copy.
#[derive(Debug, Clone, Serialize)]
pub struct RequestContext {
    pub trace_id: String,
    pub locale: String,
    pub channel: Channel,
    pub tenant: Option<Arc<TenantMetadata>>,
    pub route: Option<Arc<RouteRule>>,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>, locale: impl Into<String>, channel: Channel) -> Self {
        Self {
            trace_id: trace_id.into(),
            locale: locale.into(),
            channel,
            tenant: None,
            route: None,
        }
    }

    pub fn with_tenant(&self, tenant: Arc<TenantMetadata>) -> Self {
        Self {
            tenant: Some(tenant),
            ..self.clone()
        }
    }

    pub fn with_route(&self, route: Arc<RouteRule>) -> Self {
        Self {
            route: Some(route),
            ..self.clone()
        }
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant
            .as_ref()
            .map(|tenant| tenant.tenant_id.as_str())
            .unwrap_or(DEFAULT_TENANT_ID)
    }

    pub fn is_maintenance(&self) -> bool {
        self.tenant
            .as_ref()
            .map(|tenant| tenant.maintenance_mode)
            .unwrap_or(false)
    }

    pub fn is_read_only(&self) -> bool {
        self.tenant
            .as_ref()
            .map(|tenant| tenant.is_read_only())
            .unwrap_or(false)
    }

    /// Theme-qualified view of the resolved route, if it renders one.
    pub fn view_name(&self) -> Option<String> {
        let view = self.route.as_ref()?.view_name()?;
        Some(match &self.tenant {
            Some(tenant) => tenant.themed_view(view),
            None => view.to_string(),
        })
    }
}

/// Runs `future` with `context` bound.
pub async fn scope<F>(context: RequestContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(Arc::new(context), future).await
}

/// Synchronous counterpart of [`scope`].
pub fn sync_scope<R>(context: RequestContext, f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(Arc::new(context), f)
}

pub fn current() -> Option<Arc<RequestContext>> {
    CURRENT.try_with(Arc::clone).ok()
}

pub fn current_tenant_id() -> String {
    CURRENT
        .try_with(|context| context.tenant_id().to_string())
        .unwrap_or_else(|_| DEFAULT_TENANT_ID.to_string())
}

pub fn is_maintenance() -> bool {
    CURRENT
        .try_with(|context| context.is_maintenance())
        .unwrap_or(false)
}

pub fn is_read_only() -> bool {
    CURRENT
        .try_with(|context| context.is_read_only())
        .unwrap_or(false)
}

pub fn trace_id() -> Option<String> {
    CURRENT.try_with(|context| context.trace_id.clone()).ok()
}

/// Spawns `future` on the runtime with the caller's context and tracing span
/// re-bound inside the new task.
pub fn spawn_with_context<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = tracing::Span::current();
    match current() {
        Some(context) => tokio::spawn(CURRENT.scope(context, future).instrument(span)),
        None => tokio::spawn(future.instrument(span)),
    }
}

/// Runs `f` on the blocking pool with the caller's context bound.
pub fn spawn_blocking_with_context<F, R>(f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let span = tracing::Span::current();
    let captured = current();
    tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        match captured {
            Some(context) => CURRENT.sync_scope(context, f),
            None => f(),
        }
    })
}
