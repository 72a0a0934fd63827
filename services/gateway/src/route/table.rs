use std::sync::Arc;

use cms_pattern_match::AntMatcher;

use super::types::RouteRule;

/// Immutable set of one tenant's route rules.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
    matcher: AntMatcher,
}

impl RouteTable {
    /// Rules are kept in menu order: top-level first, then by display order
    /// and id.
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by_key(|rule| {
            (
                rule.parent_id.is_some(),
                rule.parent_id,
                rule.display_order,
                rule.id,
            )
        });
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
            matcher: AntMatcher::paths(),
        }
    }

    /// The matching rule with the longest pattern. On equal length the rule
    /// earlier in menu order wins.
    pub fn resolve(&self, path: &str) -> Option<Arc<RouteRule>> {
        let mut best: Option<&Arc<RouteRule>> = None;
        for rule in &self.rules {
            if rule.url_pattern.is_empty() || !self.matcher.matches(&rule.url_pattern, path) {
                continue;
            }
            if best.map_or(true, |current| rule.url_pattern.len() > current.url_pattern.len()) {
                best = Some(rule);
            }
        }
        best.cloned()
    }

    pub fn rules(&self) -> &[Arc<RouteRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::NewRouteRule;

    fn rule(id: u64, pattern: &str) -> RouteRule {
        NewRouteRule::new(format!("route-{id}"), pattern).into_rule(id, "shop")
    }

    #[test]
    fn longest_pattern_wins() {
        let table = RouteTable::new(vec![rule(1, "/board/**"), rule(2, "/board/notice/**")]);

        assert_eq!(table.resolve("/board/notice/42").unwrap().id, 2);
        assert_eq!(table.resolve("/board/free/1").unwrap().id, 1);
        assert!(table.resolve("/shop/items").is_none());
    }

    #[test]
    fn equal_length_prefers_menu_order() {
        let mut late = rule(1, "/board/*");
        late.display_order = 5;
        let mut early = rule(2, "/*/notice");
        early.display_order = 1;
        let table = RouteTable::new(vec![late, early]);

        for _ in 0..10 {
            assert_eq!(table.resolve("/board/notice").unwrap().id, 2);
        }
    }

    #[test]
    fn children_sort_after_top_level() {
        let mut child = rule(1, "/a/b/**");
        child.parent_id = Some(2);
        let table = RouteTable::new(vec![child, rule(2, "/a/**"), rule(3, "")]);

        let order: Vec<u64> = table.rules().iter().map(|r| r.id).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(table.resolve("/a/b/c").unwrap().id, 1);
        assert_eq!(table.resolve("/a/c").unwrap().id, 2);
    }
}
