use std::collections::BTreeSet;

use http::{Extensions, HeaderMap};
use serde::{Deserialize, Serialize};

use super::error::RouteError;
use super::types::{roles_from_csv, RouteRule};

pub const PRINCIPAL_ID_HEADER: &str = "x-principal-id";
pub const PRINCIPAL_ROLES_HEADER: &str = "x-principal-roles";

/// Authenticated caller as seen by the route gates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_any_role(&self, roles: &BTreeSet<String>) -> bool {
        roles.iter().any(|role| self.roles.contains(role))
    }
}

/// Source of the current principal for a request.
pub trait AccessContext: Send + Sync {
    fn principal(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<Principal>;
}

/// Reads a [`Principal`] placed in the request extensions by an upstream
/// authentication layer. With `trust_headers` it also accepts
/// `X-Principal-Id` / `X-Principal-Roles`, which is only safe behind a proxy
/// that strips them from client traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalExtractor {
    trust_headers: bool,
}

impl PrincipalExtractor {
    pub fn new(trust_headers: bool) -> Self {
        Self { trust_headers }
    }
}

impl AccessContext for PrincipalExtractor {
    fn principal(&self, headers: &HeaderMap, extensions: &Extensions) -> Option<Principal> {
        if let Some(principal) = extensions.get::<Principal>() {
            return Some(principal.clone());
        }
        if !self.trust_headers {
            return None;
        }

        let id = headers
            .get(PRINCIPAL_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())?;
        let roles = headers
            .get(PRINCIPAL_ROLES_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(roles_from_csv)
            .unwrap_or_default();
        Some(Principal {
            id: id.to_string(),
            roles,
        })
    }
}

/// First gate: hidden routes behave as if they did not exist.
pub fn check_accessible(rule: &RouteRule) -> Result<(), RouteError> {
    if rule.accessible {
        Ok(())
    } else {
        Err(RouteError::Inaccessible(rule.id))
    }
}

/// Second gate: unless anonymous reads are allowed, the principal must hold
/// one of the read roles.
pub fn check_read_access(rule: &RouteRule, principal: Option<&Principal>) -> Result<(), RouteError> {
    if rule.allows_anonymous_read() {
        return Ok(());
    }
    match principal {
        Some(principal) if principal.has_any_role(&rule.read_roles) => Ok(()),
        _ => Err(RouteError::Forbidden {
            route_id: rule.id,
            required: rule.read_roles.iter().cloned().collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::NewRouteRule;
    use http::HeaderValue;

    fn members_only() -> RouteRule {
        let mut rule = NewRouteRule::new("Members", "/members/**").into_rule(9, "shop");
        rule.read_roles = BTreeSet::from(["ROLE_MEMBER".to_string()]);
        rule
    }

    #[test]
    fn inaccessible_route_is_rejected() {
        let mut rule = NewRouteRule::new("Hidden", "/hidden").into_rule(3, "shop");
        assert!(check_accessible(&rule).is_ok());
        rule.accessible = false;
        assert_eq!(check_accessible(&rule), Err(RouteError::Inaccessible(3)));
    }

    #[test]
    fn read_roles_gate() {
        let rule = members_only();
        assert!(matches!(
            check_read_access(&rule, None),
            Err(RouteError::Forbidden { route_id: 9, .. })
        ));
        let guest = Principal::new("g", ["ROLE_GUEST"]);
        assert!(check_read_access(&rule, Some(&guest)).is_err());
        let member = Principal::new("m", ["ROLE_GUEST", "ROLE_MEMBER"]);
        assert!(check_read_access(&rule, Some(&member)).is_ok());

        let public = NewRouteRule::new("Public", "/").into_rule(1, "shop");
        assert!(check_read_access(&public, None).is_ok());
    }

    #[test]
    fn headers_are_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(PRINCIPAL_ID_HEADER, HeaderValue::from_static("kim"));
        headers.insert(PRINCIPAL_ROLES_HEADER, HeaderValue::from_static("ROLE_MEMBER, ROLE_USER"));
        let extensions = Extensions::new();

        assert!(PrincipalExtractor::new(false).principal(&headers, &extensions).is_none());
        let principal = PrincipalExtractor::new(true)
            .principal(&headers, &extensions)
            .unwrap();
        assert_eq!(principal.id, "kim");
        assert!(principal.roles.contains("ROLE_USER"));
    }

    #[test]
    fn extension_principal_takes_precedence() {
        let mut extensions = Extensions::new();
        extensions.insert(Principal::new("ext", ["ROLE_A"]));
        let mut headers = HeaderMap::new();
        headers.insert(PRINCIPAL_ID_HEADER, HeaderValue::from_static("hdr"));

        let principal = PrincipalExtractor::new(true)
            .principal(&headers, &extensions)
            .unwrap();
        assert_eq!(principal.id, "ext");
    }
}
