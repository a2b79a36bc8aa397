//! Host filtering for the proxy.
//!
//! Two lists decide what happens to a target host:
//!
//! 1. **Blocked hosts**: refused with `403 Forbidden`
//! 2. **Allowed hosts**: when the list is non-empty, only matching hosts are
//!    terminated and offered to the interception queue. Everything else is
//!    passed through untouched (CONNECT becomes a blind tunnel).
//!
//! With an empty allowed list every host that is not blocked is intercepted.
//!
//! # Wildcard Matching
//!
//! Patterns like `*.example.com` match any subdomain:
//! - `api.example.com` ✓
//! - `deep.nested.example.com` ✓
//! - `example.com` ✗ (base domain not matched by wildcard)
//!
//! Matching is case-insensitive.

use super::config::ProxyConfig;
use crate::ca::normalize_hostname;
use std::collections::HashSet;

/// What the proxy does with a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    /// Terminate TLS, record, and offer to the interception queue.
    Intercept,
    /// Forward without interception (blind tunnel for CONNECT).
    PassThrough,
    /// Refuse with 403.
    Block,
}

/// Compiled allowed/blocked host lists.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    allowed_exact: HashSet<String>,
    allowed_wildcards: Vec<String>,
    blocked_exact: HashSet<String>,
    blocked_wildcards: Vec<String>,
}

impl HostFilter {
    /// Compile the host lists of a configuration snapshot.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(&config.allowed_hosts, &config.blocked_hosts)
    }

    /// Compile explicit allowed and blocked patterns.
    pub fn new(allowed: &[String], blocked: &[String]) -> Self {
        let (allowed_exact, allowed_wildcards) = split_patterns(allowed);
        let (blocked_exact, blocked_wildcards) = split_patterns(blocked);

        Self {
            allowed_exact,
            allowed_wildcards,
            blocked_exact,
            blocked_wildcards,
        }
    }

    /// Decide how to handle `host`.
    ///
    /// The blocked list wins over the allowed list.
    pub fn evaluate(&self, host: &str) -> HostDecision {
        let host = normalize_hostname(host);

        if matches_any(&self.blocked_exact, &self.blocked_wildcards, &host) {
            return HostDecision::Block;
        }

        if self.allowed_exact.is_empty() && self.allowed_wildcards.is_empty() {
            return HostDecision::Intercept;
        }

        if matches_any(&self.allowed_exact, &self.allowed_wildcards, &host) {
            HostDecision::Intercept
        } else {
            HostDecision::PassThrough
        }
    }
}

fn matches_any(exact: &HashSet<String>, wildcards: &[String], host: &str) -> bool {
    exact.contains(host) || wildcards.iter().any(|p| matches_wildcard(p, host))
}

/// Split patterns into exact matches and wildcards.
///
/// Patterns starting with `*.` are treated as wildcards.
fn split_patterns(patterns: &[String]) -> (HashSet<String>, Vec<String>) {
    let mut exact = HashSet::new();
    let mut wildcards = Vec::new();

    for pattern in patterns {
        let pattern = normalize_hostname(pattern);
        if pattern.starts_with("*.") {
            wildcards.push(pattern);
        } else if !pattern.is_empty() {
            exact.insert(pattern);
        }
    }

    (exact, wildcards)
}

/// Check if a host matches a wildcard pattern.
fn matches_wildcard(pattern: &str, host: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return pattern == host;
    };

    // Something, then a dot, then the suffix
    host.len() > suffix.len()
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_intercepts_everything() {
        let filter = HostFilter::default();
        assert_eq!(filter.evaluate("example.com"), HostDecision::Intercept);
    }

    #[test]
    fn test_blocked_exact_and_wildcard() {
        let filter = HostFilter::new(&[], &strings(&["blocked.com", "*.evil.com"]));
        assert_eq!(filter.evaluate("blocked.com"), HostDecision::Block);
        assert_eq!(filter.evaluate("BLOCKED.COM"), HostDecision::Block);
        assert_eq!(filter.evaluate("api.evil.com"), HostDecision::Block);
        assert_eq!(filter.evaluate("evil.com"), HostDecision::Intercept);
    }

    #[test]
    fn test_allowed_list_passes_others_through() {
        let filter = HostFilter::new(&strings(&["api.test", "*.example.com"]), &[]);
        assert_eq!(filter.evaluate("api.test"), HostDecision::Intercept);
        assert_eq!(filter.evaluate("www.example.com"), HostDecision::Intercept);
        assert_eq!(filter.evaluate("example.com"), HostDecision::PassThrough);
        assert_eq!(filter.evaluate("other.org"), HostDecision::PassThrough);
    }

    #[test]
    fn test_block_wins_over_allow() {
        let filter = HostFilter::new(&strings(&["*.example.com"]), &strings(&["ads.example.com"]));
        assert_eq!(filter.evaluate("ads.example.com"), HostDecision::Block);
        assert_eq!(filter.evaluate("api.example.com"), HostDecision::Intercept);
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(matches_wildcard("*.example.com", "sub.example.com"));
        assert!(matches_wildcard("*.example.com", "deep.sub.example.com"));
        assert!(!matches_wildcard("*.example.com", "example.com"));
        assert!(!matches_wildcard("*.example.com", "fakeexample.com"));
        assert!(!matches_wildcard("*.example.com", "example.com.evil"));
    }

    #[test]
    fn test_from_config() {
        let config = ProxyConfig {
            blocked_hosts: strings(&["Tracker.Example"]),
            ..Default::default()
        };
        let filter = HostFilter::from_config(&config);
        assert_eq!(filter.evaluate("tracker.example."), HostDecision::Block);
    }
}
