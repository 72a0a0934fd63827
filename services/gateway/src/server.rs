use std::future::{pending, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderName;
use axum::{serve, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::admin::{RouteAdmin, TenantAdmin};
use crate::admission::{PathExclusions, UpstreamClient, XssSanitizer};
use crate::api::{create_router, ApiState};
use crate::clock::{system_clock, SharedClock};
use crate::config::GatewayConfig;
use crate::context::ChannelPrefixes;
use crate::events::ChangeBus;
use crate::ratelimit::{build_backend, RateLimiter};
use crate::route::{PrincipalExtractor, RouteResolver};
use crate::session::{SessionPolicyEngine, SessionRegistry};
use crate::store::Stores;
use crate::tenant::{TenantMetadataCache, TenantResolver};

/// Owns the wired admission components and their background tasks. The
/// tasks are aborted when the server is dropped.
pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    state: Arc<ApiState>,
    tasks: Vec<JoinHandle<()>>,
}

impl GatewayServer {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let stores = Stores::open(&config.storage).context("failed to open backing stores")?;
        Self::with_stores(config, stores).await
    }

    pub async fn with_stores(config: GatewayConfig, stores: Stores) -> Result<Self> {
        Self::with_clock(config, stores, system_clock()).await
    }

    pub async fn with_clock(config: GatewayConfig, stores: Stores, clock: SharedClock) -> Result<Self> {
        let config = Arc::new(config);
        let bus = ChangeBus::new();

        let tenants = Arc::new(TenantResolver::new(stores.tenants.clone(), &config.tenant));
        let metadata = Arc::new(TenantMetadataCache::new(
            stores.tenants.clone(),
            config.metadata_cache,
            config.tenant.store_timeout,
        ));
        let routes = Arc::new(RouteResolver::new(
            stores.routes.clone(),
            config.route_cache,
            config.tenant.store_timeout,
        ));

        let backend = build_backend(&config.rate_limit, clock.clone())
            .await
            .context("failed to build rate limit backend")?;
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit, backend));

        let registry = Arc::new(SessionRegistry::new(clock));
        let sessions = Arc::new(SessionPolicyEngine::new(&config.session, Arc::clone(&registry)));

        let upstream = config
            .upstream_url
            .as_deref()
            .map(|url| {
                UpstreamClient::new(
                    url,
                    Duration::from_secs(config.request_timeout_secs),
                    config.max_body_size_bytes,
                    &config.context.correlation_header,
                    &config.tenant.override_header,
                )
            })
            .transpose()
            .context("failed to build upstream client")?;

        let correlation_header = HeaderName::from_bytes(config.context.correlation_header.as_bytes())
            .context("CORRELATION_HEADER is not a valid header name")?;
        let override_header = HeaderName::from_bytes(config.tenant.override_header.as_bytes())
            .context("TENANT_OVERRIDE_HEADER is not a valid header name")?;

        match tenants.refresh().await {
            Ok(rules) => info!(rules, "initial tenant rules loaded"),
            Err(err) => warn!(error = %err, "initial tenant rule load failed, starting without rules"),
        }

        let tasks = vec![
            tenants.start_refresh_task(&bus, config.tenant.refresh_interval),
            metadata.start_invalidation_task(&bus),
            routes.start_invalidation_task(&bus),
            registry.start_expiry_task(config.session.idle_timeout),
        ];

        let state = Arc::new(ApiState {
            tenants,
            metadata,
            routes,
            rate_limiter,
            sessions,
            tenant_admin: Arc::new(TenantAdmin::new(
                stores.tenant_admin.clone(),
                stores.route_admin.clone(),
                bus.clone(),
            )),
            route_admin: Arc::new(RouteAdmin::new(stores.route_admin.clone(), bus.clone())),
            access: Arc::new(PrincipalExtractor::new(config.access.trust_principal_headers)),
            bus,
            channels: ChannelPrefixes::from_config(&config.context),
            exclusions: PathExclusions::new(config.tenant.excluded_paths.clone()),
            xss: XssSanitizer::from_config(&config.xss),
            upstream,
            correlation_header,
            override_header,
            config: Arc::clone(&config),
        });

        Ok(Self {
            config,
            state,
            tasks,
        })
    }

    pub fn state(&self) -> Arc<ApiState> {
        Arc::clone(&self.state)
    }

    pub fn router(&self) -> Router {
        create_router(self.state())
    }

    /// Serves until the task is aborted.
    pub async fn run(self) -> Result<()> {
        self.run_until(pending::<()>()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .context("invalid server bind address")?;
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound address")?;
        info!(
            %local_addr,
            rate_limit_backend = self.state.rate_limiter.backend_name(),
            upstream = self.config.upstream_url.as_deref().unwrap_or("none"),
            "cms-admission-gateway listening"
        );

        serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .context("server encountered an unrecoverable error")?;

        info!("cms-admission-gateway shutdown complete");
        Ok(())
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
