//! Ant-style pattern matching and best-match rule indexes.
//!
//! This crate backs both host-to-tenant resolution and path-to-route
//! resolution in the admission gateway. It provides:
//!
//! - [`AntMatcher`]: `*`, `?` and `**` wildcard matching over segments split
//!   by a configurable separator (`/` for paths, `.` for host names).
//! - [`PatternRuleIndex`]: an immutable "best match wins" index that partitions
//!   rules into exact and wildcard sets, pre-sorted once at build time.
//! - [`SharedPatternIndex`]: an atomically swappable handle so a rebuilt index
//!   can be published while in-flight lookups keep reading the previous one.

use thiserror::Error;

pub mod ant;
pub mod domain;
pub mod index;

pub use ant::{wildcard_count, AntMatcher, has_wildcard};
pub use domain::{normalize_host, validate_domain_pattern};
pub use index::{PatternRule, PatternRuleIndex, SharedPatternIndex};

/// Errors emitted while validating administrative patterns.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("pattern must not be empty")]
    Empty,

    #[error("pattern '{pattern}' contains invalid character '{ch}'")]
    InvalidCharacter { pattern: String, ch: char },

    #[error("pattern '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("pattern '{0}' may contain at most one wildcard segment")]
    TooManyWildcards(String),
}
