use std::sync::Arc;

use axum::http::HeaderName;

pub mod handlers;
pub mod router;
pub mod types;

pub use router::create_router;
pub use types::*;

use crate::admin::{RouteAdmin, TenantAdmin};
use crate::admission::{PathExclusions, UpstreamClient, XssSanitizer};
use crate::config::GatewayConfig;
use crate::context::ChannelPrefixes;
use crate::events::ChangeBus;
use crate::ratelimit::RateLimiter;
use crate::route::{AccessContext, RouteResolver};
use crate::session::SessionPolicyEngine;
use crate::tenant::{TenantMetadataCache, TenantResolver};

/// Everything the admission middleware and the HTTP handlers share.
pub struct ApiState {
    pub config: Arc<GatewayConfig>,
    pub tenants: Arc<TenantResolver>,
    pub metadata: Arc<TenantMetadataCache>,
    pub routes: Arc<RouteResolver>,
    pub rate_limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionPolicyEngine>,
    pub tenant_admin: Arc<TenantAdmin>,
    pub route_admin: Arc<RouteAdmin>,
    pub access: Arc<dyn AccessContext>,
    pub bus: ChangeBus,
    pub channels: ChannelPrefixes,
    pub exclusions: PathExclusions,
    pub xss: XssSanitizer,
    pub upstream: Option<UpstreamClient>,
    pub correlation_header: HeaderName,
    pub override_header: HeaderName,
}
