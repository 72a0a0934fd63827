use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Marker role granting read access without authentication.
pub const ANONYMOUS_ROLE: &str = "ANONYMOUS";
pub const ADMIN_ROLE: &str = "ROLE_ADMIN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteType {
    Page,
    Board,
    Link,
    Group,
}

impl RouteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteType::Page => "PAGE",
            RouteType::Board => "BOARD",
            RouteType::Link => "LINK",
            RouteType::Group => "GROUP",
        }
    }

    /// Logical view rendered for this kind of route, if any.
    pub fn default_view(&self) -> Option<&'static str> {
        match self {
            RouteType::Page => Some("content/view"),
            RouteType::Board => Some("board/list"),
            RouteType::Link | RouteType::Group => None,
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "PAGE" => Ok(RouteType::Page),
            "BOARD" => Ok(RouteType::Board),
            "LINK" => Ok(RouteType::Link),
            "GROUP" => Ok(RouteType::Group),
            other => Err(format!("unknown route type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub id: u64,
    pub tenant_id: String,
    pub name: String,
    pub url_pattern: String,
    pub route_type: RouteType,
    pub visible: bool,
    pub accessible: bool,
    pub read_roles: BTreeSet<String>,
    pub write_roles: BTreeSet<String>,
    pub parent_id: Option<u64>,
    pub display_order: i32,
}

impl RouteRule {
    pub fn allows_anonymous_read(&self) -> bool {
        self.read_roles.contains(ANONYMOUS_ROLE)
    }

    pub fn view_name(&self) -> Option<&'static str> {
        self.route_type.default_view()
    }
}

/// Route rule as submitted by an administrator, before the store assigns an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRouteRule {
    pub name: String,
    pub url_pattern: String,
    #[serde(default = "default_route_type")]
    pub route_type: RouteType,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default = "default_true")]
    pub accessible: bool,
    #[serde(default = "default_read_roles")]
    pub read_roles: BTreeSet<String>,
    #[serde(default = "default_write_roles")]
    pub write_roles: BTreeSet<String>,
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default)]
    pub display_order: i32,
}

impl NewRouteRule {
    pub fn new(name: impl Into<String>, url_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_pattern: url_pattern.into(),
            route_type: default_route_type(),
            visible: true,
            accessible: true,
            read_roles: default_read_roles(),
            write_roles: default_write_roles(),
            parent_id: None,
            display_order: 0,
        }
    }

    pub fn into_rule(self, id: u64, tenant_id: impl Into<String>) -> RouteRule {
        RouteRule {
            id,
            tenant_id: tenant_id.into(),
            name: self.name,
            url_pattern: self.url_pattern,
            route_type: self.route_type,
            visible: self.visible,
            accessible: self.accessible,
            read_roles: self.read_roles,
            write_roles: self.write_roles,
            parent_id: self.parent_id,
            display_order: self.display_order,
        }
    }
}

fn default_route_type() -> RouteType {
    RouteType::Page
}

fn default_true() -> bool {
    true
}

fn default_read_roles() -> BTreeSet<String> {
    BTreeSet::from([ANONYMOUS_ROLE.to_string()])
}

fn default_write_roles() -> BTreeSet<String> {
    BTreeSet::from([ADMIN_ROLE.to_string()])
}

/// Roles are persisted as comma separated values.
pub fn roles_to_csv(roles: &BTreeSet<String>) -> String {
    roles.iter().cloned().collect::<Vec<_>>().join(",")
}

pub fn roles_from_csv(csv: &str) -> BTreeSet<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|role| !role.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rule_defaults() {
        let rule = NewRouteRule::new("Notice", "/board/notice/**").into_rule(7, "shop");
        assert!(rule.allows_anonymous_read());
        assert!(rule.write_roles.contains(ADMIN_ROLE));
        assert_eq!(rule.view_name(), Some("content/view"));
    }

    #[test]
    fn route_type_views() {
        assert_eq!(RouteType::Board.default_view(), Some("board/list"));
        assert_eq!(RouteType::Link.default_view(), None);
        assert_eq!("group".parse::<RouteType>(), Ok(RouteType::Group));
        assert!("menu".parse::<RouteType>().is_err());
    }

    #[test]
    fn roles_csv_trims_and_skips_empty() {
        let roles = roles_from_csv(" ROLE_USER, ,ROLE_ADMIN");
        assert_eq!(roles.len(), 2);
        assert_eq!(roles_to_csv(&roles), "ROLE_ADMIN,ROLE_USER");
    }
}
