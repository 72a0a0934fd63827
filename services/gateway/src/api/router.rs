use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::admission;

use super::handlers;
use super::ApiState;

pub fn create_router(state: Arc<ApiState>) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.request_timeout_secs,
        )));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/admin/tenants",
            get(handlers::list_tenant_rules).post(handlers::create_tenant),
        )
        .route(
            "/api/admin/tenant-rules/refresh",
            post(handlers::refresh_tenant_rules),
        )
        .route(
            "/api/admin/tenants/:tenant_id",
            get(handlers::get_tenant)
                .put(handlers::update_tenant)
                .delete(handlers::delete_tenant),
        )
        .route(
            "/api/admin/tenants/:tenant_id/domains",
            post(handlers::add_domain),
        )
        .route(
            "/api/admin/domains/:pattern",
            put(handlers::replace_domain).delete(handlers::remove_domain),
        )
        .route(
            "/api/admin/tenants/:tenant_id/cache/evict",
            post(handlers::evict_tenant_caches),
        )
        .route(
            "/api/admin/tenants/:tenant_id/routes",
            get(handlers::list_routes).post(handlers::create_route),
        )
        .route(
            "/api/admin/tenants/:tenant_id/routes/:route_id",
            put(handlers::update_route).delete(handlers::delete_route),
        )
        .route(
            "/api/admin/tenants/:tenant_id/route-order",
            put(handlers::reorder_routes),
        )
        .route(
            "/api/admin/rate-limits/reset",
            post(handlers::reset_rate_limits),
        )
        .route("/api/admin/sessions", get(handlers::list_sessions))
        .route("/api/sessions", post(handlers::create_session))
        .route(
            "/api/sessions/:handle/touch",
            post(handlers::touch_session),
        )
        .route(
            "/api/sessions/:handle",
            axum::routing::delete(handlers::end_session),
        )
        .fallback(admission::forward)
        .layer(from_fn_with_state(state.clone(), admission::sanitize_input))
        .layer(from_fn_with_state(state.clone(), admission::route_gates))
        .layer(from_fn_with_state(state.clone(), admission::rate_limit))
        .layer(from_fn_with_state(state.clone(), admission::resolve_tenant))
        .layer(from_fn_with_state(state.clone(), admission::correlate))
        .with_state(state)
        .layer(middleware)
}
