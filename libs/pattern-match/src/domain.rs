use crate::ant::has_wildcard;
use crate::PatternError;

/// Normalizes a `Host` header value for lookup: lowercased, port and
/// trailing dot removed. IPv6 literals keep their brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Validates an administrative domain pattern and returns its canonical form.
///
/// A domain pattern is a dot-separated host name where at most one segment
/// may carry wildcard characters, e.g. `*.shop.com` or `shop-*.example.org`.
pub fn validate_domain_pattern(pattern: &str) -> Result<String, PatternError> {
    let canonical = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
    if canonical.is_empty() {
        return Err(PatternError::Empty);
    }

    if let Some(ch) = canonical
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '*' | '?' | '_')))
    {
        return Err(PatternError::InvalidCharacter {
            pattern: canonical.clone(),
            ch,
        });
    }

    let mut wildcard_segments = 0usize;
    for segment in canonical.split('.') {
        if segment.is_empty() {
            return Err(PatternError::EmptySegment(canonical.clone()));
        }
        if has_wildcard(segment) {
            wildcard_segments += 1;
        }
    }

    if wildcard_segments > 1 {
        return Err(PatternError::TooManyWildcards(canonical));
    }

    Ok(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_and_case() {
        assert_eq!(normalize_host("Admin.Shop.COM:8080"), "admin.shop.com");
        assert_eq!(normalize_host("shop.com."), "shop.com");
        assert_eq!(normalize_host("[::1]:8080"), "[::1]");
        assert_eq!(normalize_host("localhost"), "localhost");
    }

    #[test]
    fn accepts_single_wildcard_segment() {
        assert_eq!(validate_domain_pattern(" *.Shop.com ").unwrap(), "*.shop.com");
        assert_eq!(
            validate_domain_pattern("shop-*.example.org").unwrap(),
            "shop-*.example.org"
        );
    }

    #[test]
    fn rejects_malformed_patterns() {
        assert_eq!(validate_domain_pattern("  "), Err(PatternError::Empty));
        assert_eq!(
            validate_domain_pattern("*.*.shop.com"),
            Err(PatternError::TooManyWildcards("*.*.shop.com".into()))
        );
        assert_eq!(
            validate_domain_pattern("shop..com"),
            Err(PatternError::EmptySegment("shop..com".into()))
        );
        assert!(matches!(
            validate_domain_pattern("shop.com/admin"),
            Err(PatternError::InvalidCharacter { ch: '/', .. })
        ));
    }
}
