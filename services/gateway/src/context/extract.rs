use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ContextConfig;

const TRACE_ID_PATTERN: &str = r"^[a-zA-Z0-9\-]{1,50}$";

fn trace_id_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(TRACE_ID_PATTERN).expect("trace id pattern is valid"))
}

/// Accepts a caller supplied correlation id when it is short and plain,
/// otherwise mints a new one.
pub fn resolve_trace_id(header: Option<&str>) -> String {
    match header.map(str::trim) {
        Some(candidate) if trace_id_regex().is_match(candidate) => candidate.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Primary language tag of an `Accept-Language` header.
pub fn resolve_locale(header: Option<&str>, default_locale: &str) -> String {
    header
        .and_then(|value| accept_language::parse(value).into_iter().next())
        .filter(|tag| tag != "*")
        .unwrap_or_else(|| default_locale.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    AdminApi,
    Api,
    Admin,
    Web,
    Unknown,
}

/// Path prefixes deciding the request channel. The admin API prefix is
/// checked before the general API prefix.
#[derive(Debug, Clone)]
pub struct ChannelPrefixes {
    admin_api: String,
    api: String,
    admin: String,
}

impl ChannelPrefixes {
    pub fn from_config(config: &ContextConfig) -> Self {
        Self {
            admin_api: config.admin_api_prefix.clone(),
            api: config.api_prefix.clone(),
            admin: config.admin_prefix.clone(),
        }
    }

    pub fn classify(&self, path: &str) -> Channel {
        if has_prefix(path, &self.admin_api) {
            Channel::AdminApi
        } else if has_prefix(path, &self.api) {
            Channel::Api
        } else if has_prefix(path, &self.admin) {
            Channel::Admin
        } else {
            Channel::Web
        }
    }
}

impl Default for ChannelPrefixes {
    fn default() -> Self {
        Self::from_config(&ContextConfig::default())
    }
}

/// Segment-aware prefix check: `/api` matches `/api` and `/api/x`, not `/apix`.
fn has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}
