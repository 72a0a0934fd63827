use cms_pattern_match::AntMatcher;

/// Ant path patterns that bypass tenant resolution, e.g. `/login` or
/// `/static/**`.
#[derive(Debug, Clone)]
pub struct PathExclusions {
    patterns: Vec<String>,
    matcher: AntMatcher,
}

impl PathExclusions {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            matcher: AntMatcher::paths(),
        }
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| self.matcher.matches(pattern, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;

    #[test]
    fn default_exclusions() {
        let exclusions = PathExclusions::new(TenantConfig::default().excluded_paths);
        assert!(exclusions.is_excluded("/login"));
        assert!(exclusions.is_excluded("/static/css/site.css"));
        assert!(exclusions.is_excluded("/api/admin/tenants"));
        assert!(exclusions.is_excluded("/health"));
        assert!(!exclusions.is_excluded("/login/extra"));
        assert!(!exclusions.is_excluded("/board/notice"));
        assert!(!exclusions.is_excluded("/api/sessions"));
    }
}
