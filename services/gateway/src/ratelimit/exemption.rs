use http::Method;

use crate::config::RateLimitConfig;

/// Traffic that never consumes a token: CORS pre-flight and static assets.
#[derive(Debug, Clone, Default)]
pub struct ExemptionRules {
    path_prefixes: Vec<String>,
    extensions: Vec<String>,
}

impl ExemptionRules {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            path_prefixes: config
                .excluded_paths
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            extensions: config
                .excluded_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        if method == Method::OPTIONS {
            return true;
        }
        let path = path.to_ascii_lowercase();
        self.path_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
            || self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }
}
