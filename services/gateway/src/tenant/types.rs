use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_THEME: &str = "default";

/// Maps a host pattern such as `*.shop.com` to a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRule {
    pub domain_pattern: String,
    pub tenant_id: String,
}

/// Immutable tenant snapshot. Superseded wholesale on refresh, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMetadata {
    pub tenant_id: String,
    pub display_name: String,
    #[serde(default = "default_theme")]
    pub theme_id: String,
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default)]
    pub read_only_mode: bool,
    #[serde(default = "default_feature_flags")]
    pub feature_flags: BTreeMap<String, bool>,
}

impl TenantMetadata {
    pub fn new(tenant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            display_name: display_name.into(),
            theme_id: default_theme(),
            maintenance_mode: false,
            read_only_mode: false,
            feature_flags: default_feature_flags(),
        }
    }

    /// Maintenance implies read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only_mode || self.maintenance_mode
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.feature_flags.get(feature).copied().unwrap_or(false)
    }

    /// Qualifies a logical view name with the tenant theme, e.g.
    /// `board/list` becomes `themes/dark/board/list`. Redirect and forward
    /// directives pass through untouched.
    pub fn themed_view(&self, view: &str) -> String {
        if view.starts_with("redirect:")
            || view.starts_with("forward:")
            || self.theme_id.is_empty()
            || self.theme_id == DEFAULT_THEME
        {
            return view.to_string();
        }
        format!("themes/{}/{}", self.theme_id, view.trim_start_matches('/'))
    }
}

fn default_theme() -> String {
    DEFAULT_THEME.to_string()
}

/// Feature toggles every new tenant starts with.
pub fn default_feature_flags() -> BTreeMap<String, bool> {
    [
        ("board_module", true),
        ("shop_module", false),
        ("login_visible", true),
        ("popup", false),
        ("inquiry", true),
    ]
    .into_iter()
    .map(|(name, enabled)| (name.to_string(), enabled))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maintenance_implies_read_only() {
        let mut meta = TenantMetadata::new("shop", "Shop");
        assert!(!meta.is_read_only());
        meta.maintenance_mode = true;
        assert!(meta.is_read_only());
    }

    #[test]
    fn themed_view_respects_default_theme_and_redirects() {
        let mut meta = TenantMetadata::new("shop", "Shop");
        assert_eq!(meta.themed_view("board/list"), "board/list");

        meta.theme_id = "dark".into();
        assert_eq!(meta.themed_view("board/list"), "themes/dark/board/list");
        assert_eq!(meta.themed_view("redirect:/login"), "redirect:/login");
    }

    #[test]
    fn metadata_deserializes_with_defaults() {
        let meta: TenantMetadata =
            serde_json::from_str(r#"{"tenant_id":"shop","display_name":"Shop"}"#).unwrap();
        assert_eq!(meta.theme_id, DEFAULT_THEME);
        assert!(meta.feature_enabled("board_module"));
        assert!(!meta.feature_enabled("shop_module"));
        assert!(!meta.feature_enabled("unknown"));
    }
}
