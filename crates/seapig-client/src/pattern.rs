//! Document id patterns
//!
//! `*` is the only wildcard. A wildcard pattern matches unanchored: its
//! literal segments must appear in order somewhere inside the id. Patterns
//! without a star are concrete ids and match only themselves.

use std::fmt;

/// Wildcard character in document id patterns
pub const WILDCARD: char = '*';

/// A document id or subscription pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    raw: String,
}

impl Pattern {
    /// Create a pattern from its string form
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Get the pattern as it appears on the wire
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains a wildcard
    pub fn is_wildcard(&self) -> bool {
        self.raw.contains(WILDCARD)
    }

    /// Check whether a concrete document id matches this pattern
    pub fn matches(&self, id: &str) -> bool {
        if !self.is_wildcard() {
            return self.raw == id;
        }

        let mut rest = id;
        for segment in self.raw.split(WILDCARD).filter(|s| !s.is_empty()) {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
        true
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Pattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Pattern {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}
