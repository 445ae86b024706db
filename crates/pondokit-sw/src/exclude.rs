//! Exclusion filter for remote-service traffic.
//!
//! Authenticated backend calls (session tokens, mutating requests) must never
//! be served from the shared cache or persisted to disk, so requests matching
//! any configured prefix are never intercepted at all.

use regex::Regex;
use tracing::trace;
use url::Url;

use crate::SwError;

/// A compiled exclusion prefix.
#[derive(Debug)]
struct CompiledPrefix {
    source: String,
    regex: Regex,
}

/// URL prefix filter with `*` wildcard support.
///
/// Patterns are compiled once at construction and matched against the full
/// request URL, anchored at the start: `https://*.example.co` matches
/// `https://auth.example.co/token` but not `https://example.com/x`.
#[derive(Debug, Default)]
pub struct ExclusionFilter {
    patterns: Vec<CompiledPrefix>,
}

impl ExclusionFilter {
    /// Compile a prefix list into a filter.
    pub fn compile(prefixes: &[String]) -> Result<Self, SwError> {
        let patterns = prefixes
            .iter()
            .map(|prefix| {
                let regex = Regex::new(&wildcard_to_regex(prefix)).map_err(|e| {
                    SwError::ConfigError(format!("bad exclusion prefix {}: {}", prefix, e))
                })?;
                Ok(CompiledPrefix {
                    source: prefix.clone(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, SwError>>()?;

        Ok(Self { patterns })
    }

    /// Check whether a URL matches any exclusion prefix.
    pub fn is_excluded(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        for pattern in &self.patterns {
            if pattern.regex.is_match(url_str) {
                trace!(url = %url, prefix = %pattern.source, "URL matches exclusion prefix");
                return true;
            }
        }
        false
    }

    /// Number of configured prefixes.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether the filter has no prefixes.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Expand a wildcard prefix into an anchored regex source.
///
/// Literal segments are escaped; each `*` becomes `.*`. Matching is prefix
/// semantics, so no trailing anchor.
fn wildcard_to_regex(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 8);
    pattern.push('^');
    for (i, part) in prefix.split('*').enumerate() {
        if i > 0 {
            pattern.push_str(".*");
        }
        pattern.push_str(&regex::escape(part));
    }
    pattern
}
