use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::ant::{has_wildcard, wildcard_count, AntMatcher};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternRule<V> {
    pub pattern: String,
    pub value: V,
}

/// Immutable best-match index over `(pattern, value)` rules.
///
/// Exact patterns resolve through a hash lookup and always beat wildcard
/// patterns. Wildcard patterns are sorted once at build time by ascending
/// wildcard count, then descending pattern length, then pattern text, and the
/// first one that matches wins.
#[derive(Debug, Clone)]
pub struct PatternRuleIndex<V> {
    matcher: AntMatcher,
    exact: HashMap<String, V>,
    wildcard: Vec<PatternRule<V>>,
}

impl<V> PatternRuleIndex<V> {
    pub fn empty(matcher: AntMatcher) -> Self {
        Self {
            matcher,
            exact: HashMap::new(),
            wildcard: Vec::new(),
        }
    }

    /// Builds an index. When the same pattern appears twice the first
    /// occurrence is kept.
    pub fn build<I>(matcher: AntMatcher, rules: I) -> Self
    where
        I: IntoIterator<Item = (String, V)>,
    {
        let mut exact = HashMap::new();
        let mut wildcard: Vec<PatternRule<V>> = Vec::new();

        for (pattern, value) in rules {
            if has_wildcard(&pattern) {
                if wildcard.iter().any(|rule| rule.pattern == pattern) {
                    continue;
                }
                wildcard.push(PatternRule { pattern, value });
            } else {
                exact.entry(pattern).or_insert(value);
            }
        }

        wildcard.sort_by(|a, b| {
            wildcard_count(&a.pattern)
                .cmp(&wildcard_count(&b.pattern))
                .then_with(|| b.pattern.len().cmp(&a.pattern.len()))
                .then_with(|| a.pattern.cmp(&b.pattern))
        });

        debug!(
            exact = exact.len(),
            wildcard = wildcard.len(),
            "built pattern rule index"
        );

        Self {
            matcher,
            exact,
            wildcard,
        }
    }

    pub fn lookup(&self, candidate: &str) -> Option<&V> {
        if let Some(value) = self.exact.get(candidate) {
            return Some(value);
        }

        self.wildcard
            .iter()
            .find(|rule| self.matcher.matches(&rule.pattern, candidate))
            .map(|rule| &rule.value)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wildcard patterns in evaluation order.
    pub fn wildcard_patterns(&self) -> impl Iterator<Item = &str> {
        self.wildcard.iter().map(|rule| rule.pattern.as_str())
    }
}

/// Publishes [`PatternRuleIndex`] snapshots. Readers never block and always
/// observe either the previous or the next complete index.
pub struct SharedPatternIndex<V> {
    current: ArcSwap<PatternRuleIndex<V>>,
}

impl<V> SharedPatternIndex<V> {
    pub fn new(index: PatternRuleIndex<V>) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    pub fn snapshot(&self) -> Arc<PatternRuleIndex<V>> {
        self.current.load_full()
    }

    pub fn replace(&self, index: PatternRuleIndex<V>) {
        self.current.store(Arc::new(index));
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> SharedPatternIndex<V> {
    pub fn lookup(&self, candidate: &str) -> Option<V> {
        self.current.load().lookup(candidate).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[(&str, &str)]) -> Vec<(String, String)> {
        entries
            .iter()
            .map(|(p, v)| (p.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn exact_beats_wildcard() {
        let index = PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules(&[("*.shop.com", "A"), ("admin.shop.com", "B")]),
        );
        assert_eq!(index.lookup("admin.shop.com").map(String::as_str), Some("B"));
        assert_eq!(index.lookup("x.shop.com").map(String::as_str), Some("A"));
        assert_eq!(index.lookup("shop.org"), None);
    }

    #[test]
    fn fewer_wildcards_then_longer_pattern_first() {
        let index = PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules(&[
                ("**.com", "broad"),
                ("*.com", "short"),
                ("*.shop.com", "long"),
            ]),
        );
        let order: Vec<&str> = index.wildcard_patterns().collect();
        assert_eq!(order, vec!["*.shop.com", "*.com", "**.com"]);
        assert_eq!(index.lookup("a.shop.com").map(String::as_str), Some("long"));
        assert_eq!(index.lookup("a.com").map(String::as_str), Some("short"));
        assert_eq!(index.lookup("a.b.c.com").map(String::as_str), Some("broad"));
    }

    #[test]
    fn duplicate_pattern_keeps_first() {
        let index = PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules(&[("shop.com", "first"), ("shop.com", "second")]),
        );
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup("shop.com").map(String::as_str), Some("first"));
    }

    #[test]
    fn shared_index_swaps_whole_snapshot() {
        let shared = SharedPatternIndex::new(PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules(&[("old.com", "old")]),
        ));
        let held = shared.snapshot();

        shared.replace(PatternRuleIndex::build(
            AntMatcher::hosts(),
            rules(&[("new.com", "new")]),
        ));

        assert_eq!(held.lookup("old.com").map(String::as_str), Some("old"));
        assert_eq!(shared.lookup("old.com"), None);
        assert_eq!(shared.lookup("new.com").as_deref(), Some("new"));
    }
}
