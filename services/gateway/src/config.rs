use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::ratelimit::client_ip::parse_trusted_proxy;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub max_body_size_bytes: usize,
    pub log_level: String,
    /// Admitted requests are forwarded here when set; otherwise the gateway
    /// answers with the admission outcome itself.
    pub upstream_url: Option<String>,
    pub tenant: TenantConfig,
    pub metadata_cache: CacheSettings,
    pub route_cache: CacheSettings,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub context: ContextConfig,
    pub access: AccessConfig,
    pub storage: StorageConfig,
    pub xss: XssConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_entries: u64,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    /// Ant patterns bypassing tenant resolution entirely.
    pub excluded_paths: Vec<String>,
    pub override_header: String,
    pub override_enabled: bool,
    pub refresh_interval: Duration,
    pub result_cache: CacheSettings,
    pub store_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    Local,
    /// Shared bucket store living in this process; useful for tests and single-node setups.
    Distributed,
    Redis,
}

impl RateLimitMode {
    fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" | "shared" => Ok(Self::Distributed),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unsupported rate limit mode: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub mode: RateLimitMode,
    pub default_capacity: u64,
    pub refill_period: Duration,
    pub per_tenant_capacities: HashMap<String, u64>,
    pub trusted_proxies: Vec<String>,
    /// Lowercased path prefixes that never consume a token.
    pub excluded_paths: Vec<String>,
    pub excluded_extensions: Vec<String>,
    /// Local buckets hold `capacity / server_count` so the fleet-wide rate stays close to the configured one.
    pub server_count: u32,
    pub local_max_keys: u64,
    pub local_idle_expiry: Duration,
    pub bucket_ttl: Duration,
    pub cas_max_retries: u32,
    pub backend_timeout: Duration,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// -1 means unlimited.
    pub tenant_limits: HashMap<String, i64>,
    pub role_limits: HashMap<String, i64>,
    pub default_limit: i64,
    pub reject_when_exceeded: bool,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub correlation_header: String,
    pub admin_api_prefix: String,
    pub api_prefix: String,
    pub admin_prefix: String,
    pub default_locale: String,
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Read the principal from `X-Principal-Id` / `X-Principal-Roles`. Only for
    /// deployments where an upstream authenticator sets those headers.
    pub trust_principal_headers: bool,
}

/// Markup stripping for form and JSON bodies of state-changing requests.
#[derive(Debug, Clone)]
pub struct XssConfig {
    pub enabled: bool,
    /// Path patterns whose bodies pass through untouched.
    pub ignored_paths: Vec<String>,
    /// Path pattern with the parameter names that may carry HTML under it.
    pub allow_html: Vec<(String, Vec<String>)>,
}

impl Default for XssConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignored_paths: Vec::new(),
            allow_html: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            excluded_paths: [
                "/login",
                "/login-process",
                "/find-password",
                "/register",
                "/favicon.ico",
                "/error",
                "/static/**",
                "/actuator/**",
                "/api/admin/**",
                "/health",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            override_header: "X-Tenant-ID".to_string(),
            override_enabled: true,
            refresh_interval: Duration::from_secs(60),
            result_cache: CacheSettings {
                max_entries: 10_000,
                ttl: Duration::from_secs(600),
            },
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: RateLimitMode::Local,
            default_capacity: 100,
            refill_period: Duration::from_secs(60),
            per_tenant_capacities: HashMap::new(),
            trusted_proxies: vec!["127.0.0.1".to_string(), "::1".to_string()],
            excluded_paths: vec![
                "/static/".to_string(),
                "/favicon.ico".to_string(),
                "/health".to_string(),
            ],
            excluded_extensions: [
                ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".woff", ".woff2",
            ]
            .iter()
            .map(|e| e.to_string())
            .collect(),
            server_count: 1,
            local_max_keys: 100_000,
            local_idle_expiry: Duration::from_secs(3600),
            bucket_ttl: Duration::from_secs(3600),
            cas_max_retries: 5,
            backend_timeout: Duration::from_millis(250),
            redis_url: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tenant_limits: HashMap::new(),
            role_limits: HashMap::new(),
            default_limit: 1,
            reject_when_exceeded: false,
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            correlation_header: "X-Correlation-ID".to_string(),
            admin_api_prefix: "/api/admin".to_string(),
            api_prefix: "/api".to_string(),
            admin_prefix: "/admin".to_string(),
            default_locale: "en".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let cache = CacheSettings {
            max_entries: 1_000,
            ttl: Duration::from_secs(600),
        };
        Self {
            host: "127.0.0.1".to_string(),
            port: 8190,
            request_timeout_secs: 30,
            max_body_size_bytes: 10 * 1024 * 1024,
            log_level: "info".to_string(),
            upstream_url: None,
            tenant: TenantConfig::default(),
            metadata_cache: cache,
            route_cache: cache,
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            context: ContextConfig::default(),
            access: AccessConfig {
                trust_principal_headers: false,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                data_dir: PathBuf::from("data/gateway"),
            },
            xss: XssConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(host) = env::var("GATEWAY_HOST") {
            cfg.host = host;
        }
        if let Ok(port) = env::var("GATEWAY_PORT") {
            cfg.port = port.parse().context("GATEWAY_PORT must be a valid u16")?;
        }
        if let Ok(timeout) = env::var("REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout_secs = timeout
                .parse()
                .context("REQUEST_TIMEOUT_SECS must be a positive integer")?;
        }
        if let Ok(size) = env::var("MAX_BODY_SIZE_BYTES") {
            cfg.max_body_size_bytes = size
                .parse()
                .context("MAX_BODY_SIZE_BYTES must be a positive integer")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }
        if let Ok(url) = env::var("UPSTREAM_URL") {
            cfg.upstream_url = non_empty(url);
        }

        cfg.load_tenant_env()?;
        cfg.load_cache_env()?;
        cfg.load_rate_limit_env()?;
        cfg.load_session_env()?;
        cfg.load_context_env()?;
        cfg.load_xss_env()?;

        if let Ok(flag) = env::var("TRUST_PRINCIPAL_HEADERS") {
            cfg.access.trust_principal_headers = parse_bool(&flag)
                .with_context(|| format!("TRUST_PRINCIPAL_HEADERS is invalid: {flag}"))?;
        }
        if let Ok(backend) = env::var("STORAGE_BACKEND") {
            cfg.storage.backend = match backend.to_ascii_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                "sqlite" => StorageBackend::Sqlite,
                other => anyhow::bail!("unsupported STORAGE_BACKEND: {other}"),
            };
        }
        if let Ok(dir) = env::var("GATEWAY_DATA_DIR") {
            cfg.storage.data_dir = PathBuf::from(dir);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn load_tenant_env(&mut self) -> Result<()> {
        let tenant = &mut self.tenant;
        if let Ok(paths) = env::var("TENANT_EXCLUDED_PATHS") {
            tenant.excluded_paths = parse_list(&paths);
        }
        if let Ok(header) = env::var("TENANT_OVERRIDE_HEADER") {
            tenant.override_header = header;
        }
        if let Ok(flag) = env::var("TENANT_OVERRIDE_ENABLED") {
            tenant.override_enabled = parse_bool(&flag)
                .with_context(|| format!("TENANT_OVERRIDE_ENABLED is invalid: {flag}"))?;
        }
        if let Ok(secs) = env::var("TENANT_REFRESH_INTERVAL_SECS") {
            tenant.refresh_interval = parse_secs(&secs, "TENANT_REFRESH_INTERVAL_SECS")?;
        }
        if let Ok(size) = env::var("TENANT_RESULT_CACHE_SIZE") {
            tenant.result_cache.max_entries = size
                .parse()
                .context("TENANT_RESULT_CACHE_SIZE must be a positive integer")?;
        }
        if let Ok(secs) = env::var("TENANT_RESULT_CACHE_TTL_SECS") {
            tenant.result_cache.ttl = parse_secs(&secs, "TENANT_RESULT_CACHE_TTL_SECS")?;
        }
        if let Ok(millis) = env::var("TENANT_STORE_TIMEOUT_MS") {
            tenant.store_timeout = parse_millis(&millis, "TENANT_STORE_TIMEOUT_MS")?;
        }
        Ok(())
    }

    fn load_cache_env(&mut self) -> Result<()> {
        if let Ok(size) = env::var("METADATA_CACHE_SIZE") {
            self.metadata_cache.max_entries = size
                .parse()
                .context("METADATA_CACHE_SIZE must be a positive integer")?;
        }
        if let Ok(secs) = env::var("METADATA_CACHE_TTL_SECS") {
            self.metadata_cache.ttl = parse_secs(&secs, "METADATA_CACHE_TTL_SECS")?;
        }
        if let Ok(size) = env::var("ROUTE_CACHE_SIZE") {
            self.route_cache.max_entries = size
                .parse()
                .context("ROUTE_CACHE_SIZE must be a positive integer")?;
        }
        if let Ok(secs) = env::var("ROUTE_CACHE_TTL_SECS") {
            self.route_cache.ttl = parse_secs(&secs, "ROUTE_CACHE_TTL_SECS")?;
        }
        Ok(())
    }

    fn load_rate_limit_env(&mut self) -> Result<()> {
        let rl = &mut self.rate_limit;
        if let Ok(flag) = env::var("RATE_LIMIT_ENABLED") {
            rl.enabled = parse_bool(&flag)
                .with_context(|| format!("RATE_LIMIT_ENABLED is invalid: {flag}"))?;
        }
        if let Ok(mode) = env::var("RATE_LIMIT_MODE") {
            rl.mode = RateLimitMode::parse(&mode)?;
        }
        if let Ok(capacity) = env::var("RATE_LIMIT_CAPACITY") {
            rl.default_capacity = capacity
                .parse()
                .context("RATE_LIMIT_CAPACITY must be a positive integer")?;
        }
        if let Ok(secs) = env::var("RATE_LIMIT_REFILL_SECS") {
            rl.refill_period = parse_secs(&secs, "RATE_LIMIT_REFILL_SECS")?;
        }
        if let Ok(map) = env::var("RATE_LIMIT_TENANT_CAPACITIES") {
            rl.per_tenant_capacities = parse_map(&map, "RATE_LIMIT_TENANT_CAPACITIES")?;
        }
        if let Ok(proxies) = env::var("RATE_LIMIT_TRUSTED_PROXIES") {
            rl.trusted_proxies = parse_list(&proxies);
        }
        if let Ok(paths) = env::var("RATE_LIMIT_EXCLUDED_PATHS") {
            rl.excluded_paths = parse_list(&paths)
                .into_iter()
                .map(|p| p.to_ascii_lowercase())
                .collect();
        }
        if let Ok(exts) = env::var("RATE_LIMIT_EXCLUDED_EXTENSIONS") {
            rl.excluded_extensions = parse_list(&exts)
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect();
        }
        if let Ok(count) = env::var("RATE_LIMIT_SERVER_COUNT") {
            rl.server_count = count
                .parse()
                .context("RATE_LIMIT_SERVER_COUNT must be a positive integer")?;
        }
        if let Ok(keys) = env::var("RATE_LIMIT_LOCAL_MAX_KEYS") {
            rl.local_max_keys = keys
                .parse()
                .context("RATE_LIMIT_LOCAL_MAX_KEYS must be a positive integer")?;
        }
        if let Ok(secs) = env::var("RATE_LIMIT_LOCAL_IDLE_SECS") {
            rl.local_idle_expiry = parse_secs(&secs, "RATE_LIMIT_LOCAL_IDLE_SECS")?;
        }
        if let Ok(secs) = env::var("RATE_LIMIT_BUCKET_TTL_SECS") {
            rl.bucket_ttl = parse_secs(&secs, "RATE_LIMIT_BUCKET_TTL_SECS")?;
        }
        if let Ok(retries) = env::var("RATE_LIMIT_CAS_RETRIES") {
            rl.cas_max_retries = retries
                .parse()
                .context("RATE_LIMIT_CAS_RETRIES must be a positive integer")?;
        }
        if let Ok(millis) = env::var("RATE_LIMIT_BACKEND_TIMEOUT_MS") {
            rl.backend_timeout = parse_millis(&millis, "RATE_LIMIT_BACKEND_TIMEOUT_MS")?;
        }
        if let Ok(url) = env::var("RATE_LIMIT_REDIS_URL") {
            rl.redis_url = non_empty(url);
        }
        Ok(())
    }

    fn load_session_env(&mut self) -> Result<()> {
        let session = &mut self.session;
        if let Ok(map) = env::var("SESSION_TENANT_LIMITS") {
            session.tenant_limits = parse_map(&map, "SESSION_TENANT_LIMITS")?;
        }
        if let Ok(map) = env::var("SESSION_ROLE_LIMITS") {
            session.role_limits = parse_map(&map, "SESSION_ROLE_LIMITS")?;
        }
        if let Ok(limit) = env::var("SESSION_DEFAULT_LIMIT") {
            session.default_limit = limit
                .parse()
                .context("SESSION_DEFAULT_LIMIT must be an integer (-1 for unlimited)")?;
        }
        if let Ok(flag) = env::var("SESSION_REJECT_WHEN_EXCEEDED") {
            session.reject_when_exceeded = parse_bool(&flag)
                .with_context(|| format!("SESSION_REJECT_WHEN_EXCEEDED is invalid: {flag}"))?;
        }
        if let Ok(secs) = env::var("SESSION_IDLE_TIMEOUT_SECS") {
            session.idle_timeout = parse_secs(&secs, "SESSION_IDLE_TIMEOUT_SECS")?;
        }
        Ok(())
    }

    fn load_context_env(&mut self) -> Result<()> {
        let context = &mut self.context;
        if let Ok(header) = env::var("CORRELATION_HEADER") {
            context.correlation_header = header;
        }
        if let Ok(prefix) = env::var("CHANNEL_ADMIN_API_PREFIX") {
            context.admin_api_prefix = prefix;
        }
        if let Ok(prefix) = env::var("CHANNEL_API_PREFIX") {
            context.api_prefix = prefix;
        }
        if let Ok(prefix) = env::var("CHANNEL_ADMIN_PREFIX") {
            context.admin_prefix = prefix;
        }
        if let Ok(locale) = env::var("DEFAULT_LOCALE") {
            context.default_locale = locale;
        }
        Ok(())
    }

    fn load_xss_env(&mut self) -> Result<()> {
        let xss = &mut self.xss;
        if let Ok(flag) = env::var("XSS_ENABLED") {
            xss.enabled =
                parse_bool(&flag).with_context(|| format!("XSS_ENABLED is invalid: {flag}"))?;
        }
        if let Ok(paths) = env::var("XSS_IGNORED_PATHS") {
            xss.ignored_paths = parse_list(&paths);
        }
        if let Ok(rules) = env::var("XSS_ALLOW_HTML") {
            xss.allow_html = parse_allow_html(&rules)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("REQUEST_TIMEOUT_SECS must be greater than zero");
        }
        if self.max_body_size_bytes == 0 {
            anyhow::bail!("MAX_BODY_SIZE_BYTES must be greater than zero");
        }
        if let Some(url) = &self.upstream_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                anyhow::bail!("UPSTREAM_URL must be an http(s) URL: {url}");
            }
        }

        if self.tenant.override_header.trim().is_empty() {
            anyhow::bail!("TENANT_OVERRIDE_HEADER must not be empty");
        }
        if self.tenant.refresh_interval.is_zero() {
            anyhow::bail!("TENANT_REFRESH_INTERVAL_SECS must be greater than zero");
        }
        for (name, cache) in [
            ("TENANT_RESULT_CACHE", &self.tenant.result_cache),
            ("METADATA_CACHE", &self.metadata_cache),
            ("ROUTE_CACHE", &self.route_cache),
        ] {
            if cache.max_entries == 0 {
                anyhow::bail!("{name}_SIZE must be greater than zero");
            }
            if cache.ttl.is_zero() {
                anyhow::bail!("{name}_TTL_SECS must be greater than zero");
            }
        }

        let rl = &self.rate_limit;
        if rl.default_capacity == 0 {
            anyhow::bail!("RATE_LIMIT_CAPACITY must be greater than zero");
        }
        if let Some((tenant, _)) = rl.per_tenant_capacities.iter().find(|(_, c)| **c == 0) {
            anyhow::bail!("RATE_LIMIT_TENANT_CAPACITIES for {tenant} must be greater than zero");
        }
        if rl.refill_period.is_zero() {
            anyhow::bail!("RATE_LIMIT_REFILL_SECS must be greater than zero");
        }
        if rl.server_count == 0 {
            anyhow::bail!("RATE_LIMIT_SERVER_COUNT must be greater than zero");
        }
        if rl.cas_max_retries == 0 {
            anyhow::bail!("RATE_LIMIT_CAS_RETRIES must be greater than zero");
        }
        if rl.mode == RateLimitMode::Redis && rl.redis_url.is_none() {
            anyhow::bail!("RATE_LIMIT_REDIS_URL is required when RATE_LIMIT_MODE=redis");
        }
        for proxy in &rl.trusted_proxies {
            parse_trusted_proxy(proxy)
                .with_context(|| format!("RATE_LIMIT_TRUSTED_PROXIES entry is invalid: {proxy}"))?;
        }

        let session = &self.session;
        let limits = session
            .tenant_limits
            .values()
            .chain(session.role_limits.values())
            .chain(std::iter::once(&session.default_limit));
        for limit in limits {
            if *limit < -1 || *limit == 0 {
                anyhow::bail!("session limits must be positive or -1 (unlimited), got {limit}");
            }
        }

        if self.storage.backend == StorageBackend::Sqlite {
            ensure_directory(&self.storage.data_dir)?;
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_secs(value: &str, name: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("{name} must be a number of seconds"))?;
    Ok(Duration::from_secs(secs))
}

fn parse_millis(value: &str, name: &str) -> Result<Duration> {
    let millis: u64 = value
        .parse()
        .with_context(|| format!("{name} must be a number of milliseconds"))?;
    Ok(Duration::from_millis(millis))
}

pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `key=value,key=value`.
pub(crate) fn parse_map<V>(value: &str, name: &str) -> Result<HashMap<String, V>>
where
    V: std::str::FromStr,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    let mut map = HashMap::new();
    for entry in parse_list(value) {
        let (key, raw) = entry
            .split_once('=')
            .with_context(|| format!("{name} entry '{entry}' must look like key=value"))?;
        let parsed = raw
            .trim()
            .parse()
            .with_context(|| format!("{name} entry '{entry}' has an invalid value"))?;
        map.insert(key.trim().to_string(), parsed);
    }
    Ok(map)
}

/// Parses `/board/**=content|summary,/pages/**=body`.
fn parse_allow_html(value: &str) -> Result<Vec<(String, Vec<String>)>> {
    let mut rules = Vec::new();
    for entry in parse_list(value) {
        let (pattern, params) = entry
            .split_once('=')
            .with_context(|| format!("XSS_ALLOW_HTML entry '{entry}' must look like pattern=param|param"))?;
        let params: Vec<String> = params
            .split('|')
            .map(str::trim)
            .filter(|param| !param.is_empty())
            .map(str::to_string)
            .collect();
        if params.is_empty() {
            anyhow::bail!("XSS_ALLOW_HTML entry '{entry}' names no parameters");
        }
        rules.push((pattern.trim().to_string(), params));
    }
    Ok(rules)
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => anyhow::bail!("invalid boolean value {value}"),
    }
}
