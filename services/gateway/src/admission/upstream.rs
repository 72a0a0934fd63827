use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use reqwest::Client;
use tracing::{debug, info};

use crate::context::RequestContext;
use crate::error::AdmissionError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ROUTE_HEADER: &str = "x-route-id";
pub const LOCALE_HEADER: &str = "x-locale";
pub const VIEW_HEADER: &str = "x-view-name";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Forwards admitted requests to the protected application, stamping them
/// with the resolved tenant and correlation headers.
pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
    max_body_bytes: usize,
    correlation_header: HeaderName,
    override_header: Option<HeaderName>,
}

impl UpstreamClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        max_body_bytes: usize,
        correlation_header: &str,
        override_header: &str,
    ) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(20)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_body_bytes,
            correlation_header: HeaderName::from_bytes(correlation_header.as_bytes())?,
            override_header: HeaderName::from_bytes(override_header.as_bytes()).ok(),
        })
    }

    pub async fn forward(
        &self,
        request: Request,
        context: Option<&RequestContext>,
        peer: Option<SocketAddr>,
    ) -> Result<Response, AdmissionError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(%url, "forwarding admitted request");

        let body = to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|_| AdmissionError::BodyTooLarge {
                limit: self.max_body_bytes,
            })?;

        let mut headers = self.sanitize(&parts.headers);
        if let Some(context) = context {
            self.stamp(&mut headers, context);
        }
        if let Some(peer) = peer {
            if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = parts.headers.get(axum::http::header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));

        let mut upstream = self
            .http_client
            .request(parts.method.clone(), &url)
            .headers(headers);
        if !body.is_empty() {
            upstream = upstream.body(body);
        }

        let start = Instant::now();
        let upstream_response = upstream
            .send()
            .await
            .map_err(|e| AdmissionError::Upstream(e.to_string()))?;

        let status = upstream_response.status();
        info!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "upstream response received"
        );

        let mut response = axum::http::Response::builder().status(status);
        for (name, value) in upstream_response.headers() {
            if !is_hop_by_hop(name.as_str()) && name != axum::http::header::CONTENT_LENGTH {
                response = response.header(name, value);
            }
        }
        let bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| AdmissionError::Upstream(format!("failed to read upstream body: {e}")))?;

        response
            .body(Body::from(bytes))
            .map_err(|e| AdmissionError::Upstream(format!("failed to build response: {e}")))
    }

    /// Drops hop-by-hop headers plus anything the gateway sets itself, so a
    /// client cannot spoof the resolved tenant downstream.
    fn sanitize(&self, headers: &HeaderMap) -> HeaderMap {
        let mut sanitized = HeaderMap::new();
        for (name, value) in headers {
            let lower = name.as_str();
            if is_hop_by_hop(lower)
                || lower == "host"
                || lower == "content-length"
                || lower == TENANT_HEADER
                || lower == ROUTE_HEADER
                || lower == VIEW_HEADER
                || lower == LOCALE_HEADER
                || self.override_header.as_ref() == Some(name)
            {
                continue;
            }
            sanitized.append(name.clone(), value.clone());
        }
        sanitized
    }

    fn stamp(&self, headers: &mut HeaderMap, context: &RequestContext) {
        let mut set = |name: HeaderName, value: &str| {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };
        set(self.correlation_header.clone(), &context.trace_id);
        set(HeaderName::from_static(LOCALE_HEADER), &context.locale);
        if context.tenant.is_some() {
            set(HeaderName::from_static(TENANT_HEADER), context.tenant_id());
        }
        if let Some(route) = &context.route {
            set(HeaderName::from_static(ROUTE_HEADER), &route.id.to_string());
        }
        if let Some(view) = context.view_name() {
            set(HeaderName::from_static(VIEW_HEADER), &view);
        }
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::Channel;
    use crate::tenant::TenantMetadata;

    fn client() -> UpstreamClient {
        UpstreamClient::new(
            "http://127.0.0.1:9/",
            Duration::from_secs(1),
            1024,
            "X-Correlation-ID",
            "X-Tenant-ID",
        )
        .unwrap()
    }

    #[test]
    fn sanitize_strips_hop_by_hop_and_spoofed_tenant() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-tenant-id", HeaderValue::from_static("someone-else"));
        headers.insert("accept", HeaderValue::from_static("text/html"));

        let sanitized = client().sanitize(&headers);
        assert!(sanitized.get("connection").is_none());
        assert!(sanitized.get("x-tenant-id").is_none());
        assert_eq!(sanitized["accept"], "text/html");
    }

    #[test]
    fn stamp_sets_context_headers() {
        let context = RequestContext::new("trace-9", "ko", Channel::Web)
            .with_tenant(Arc::new(TenantMetadata::new("shop", "Shop")));
        let mut headers = HeaderMap::new();
        client().stamp(&mut headers, &context);

        assert_eq!(headers["x-correlation-id"], "trace-9");
        assert_eq!(headers[TENANT_HEADER], "shop");
        assert_eq!(headers[LOCALE_HEADER], "ko");
        assert!(headers.get(ROUTE_HEADER).is_none());
    }
}
