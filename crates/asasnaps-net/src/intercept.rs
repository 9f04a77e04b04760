//! URL patterns used to keep requests away from the worker.

use serde::{Deserialize, Serialize};
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// Prefix match.
    Prefix,
    /// Suffix match (e.g., file extension).
    Suffix,
    /// Contains substring.
    Contains,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    /// Pattern type.
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::new(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::new(PatternType::Prefix, prefix)
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::new(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::new(PatternType::Contains, substring)
    }

    fn new(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        self.matches_str(url.as_str())
    }

    /// Check a raw URL string, for URLs that never parsed.
    pub fn matches_str(&self, url: &str) -> bool {
        match self.pattern_type {
            PatternType::Exact => url == self.pattern,
            PatternType::Prefix => url.starts_with(&self.pattern),
            PatternType::Suffix => url.ends_with(&self.pattern),
            PatternType::Contains => url.contains(&self.pattern),
        }
    }
}

/// First pattern in `patterns` matching `url`, if any.
pub fn first_match<'a>(patterns: &'a [UrlPattern], url: &Url) -> Option<&'a UrlPattern> {
    patterns.iter().find(|p| p.matches(url))
}
