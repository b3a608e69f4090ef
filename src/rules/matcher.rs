//! Domain matcher over the four selector rule kinds
//!
//! A [`RuleSet`] is an immutable compilation of the domain selectors from a
//! store snapshot. [`DomainMatcher`] publishes rulesets atomically: readers
//! load a pointer and complete on the snapshot they observed, updates build
//! a full replacement and swap it in. A reader never sees a partially-built
//! ruleset and never blocks an updater.
//!
//! Match order for a lowercase name without trailing dot:
//!
//! 1. **Exact** lookup
//! 2. **Suffix** walk: test the name, strip up to and including the first
//!    `.`, repeat
//! 3. **Keyword** substring scan
//! 4. **Regexp** scan

use std::collections::HashSet;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use arc_swap::ArcSwap;
use regex::Regex;
use tracing::debug;

use crate::store::{Selector, SelectorKind};

/// Counts of each rule kind in the published ruleset
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RuleStats {
    pub suffixes: usize,
    pub exact: usize,
    pub keywords: usize,
    pub regexps: usize,
}

/// Immutable compiled rule collection
#[derive(Debug, Default)]
struct RuleSet {
    suffixes: HashSet<String>,
    exact: HashSet<String>,
    /// Substring automaton over the keyword list; `None` when empty
    keywords: Option<AhoCorasick>,
    keyword_count: usize,
    regexps: Vec<Regex>,
}

impl RuleSet {
    fn compile(selectors: &[Selector]) -> Self {
        let mut suffixes = HashSet::new();
        let mut exact = HashSet::new();
        let mut keywords: Vec<String> = Vec::new();
        let mut regexps = Vec::new();

        for sel in selectors {
            match sel.kind() {
                SelectorKind::DomainSuffix => {
                    suffixes.insert(sel.domain_value().to_ascii_lowercase());
                }
                SelectorKind::DomainFull => {
                    exact.insert(sel.domain_value().to_ascii_lowercase());
                }
                SelectorKind::DomainKeyword => {
                    keywords.push(sel.domain_value().to_ascii_lowercase());
                }
                SelectorKind::DomainRegexp => match Regex::new(sel.domain_value()) {
                    Ok(re) => regexps.push(re),
                    Err(e) => {
                        // Invalid expressions are dropped; they neither match
                        // anything nor reject the other rules.
                        debug!(pattern = sel.domain_value(), error = %e, "dropping invalid regexp selector");
                    }
                },
                SelectorKind::Ip | SelectorKind::Cidr => {}
            }
        }

        let keyword_count = keywords.len();
        let keywords = if keywords.is_empty() {
            None
        } else {
            // Build failure is practically unreachable for plain substring
            // patterns; treat it like an invalid rule and drop the list.
            AhoCorasick::new(&keywords)
                .map_err(|e| debug!(error = %e, "dropping keyword automaton"))
                .ok()
        };

        Self {
            suffixes,
            exact,
            keywords,
            keyword_count,
            regexps,
        }
    }

    fn matches(&self, domain: &str) -> bool {
        if self.exact.contains(domain) {
            return true;
        }

        // Suffix walk: for "a.b.example.com" test "a.b.example.com",
        // "b.example.com", "example.com", "com".
        let mut d = domain;
        loop {
            if self.suffixes.contains(d) {
                return true;
            }
            match d.find('.') {
                Some(i) => d = &d[i + 1..],
                None => break,
            }
        }

        if let Some(ac) = &self.keywords {
            if ac.is_match(domain) {
                return true;
            }
        }

        self.regexps.iter().any(|re| re.is_match(domain))
    }

    fn stats(&self) -> RuleStats {
        RuleStats {
            suffixes: self.suffixes.len(),
            exact: self.exact.len(),
            keywords: self.keyword_count,
            regexps: self.regexps.len(),
        }
    }
}

/// Atomically replaceable domain matcher
#[derive(Debug)]
pub struct DomainMatcher {
    rules: ArcSwap<RuleSet>,
}

impl DomainMatcher {
    /// Create an empty matcher that matches nothing
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    /// Test a name against the current ruleset.
    ///
    /// The name must be lowercase without a trailing dot; the DNS handler
    /// normalises query names before calling this.
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        if domain.is_empty() {
            return false;
        }
        self.rules.load().matches(domain)
    }

    /// Replace the ruleset from a snapshot's selectors.
    ///
    /// Only domain selectors contribute; IP/CIDR selectors are ignored.
    /// The new ruleset is built completely before the pointer swap, so
    /// concurrent readers see either the old or the new rules, never a mix.
    pub fn update(&self, selectors: &[Selector]) {
        let ruleset = RuleSet::compile(selectors);
        let stats = ruleset.stats();
        self.rules.store(Arc::new(ruleset));
        debug!(
            suffixes = stats.suffixes,
            exact = stats.exact,
            keywords = stats.keywords,
            regexps = stats.regexps,
            "matcher ruleset replaced"
        );
    }

    /// Counts of each rule kind in the published ruleset
    #[must_use]
    pub fn stats(&self) -> RuleStats {
        self.rules.load().stats()
    }
}

impl Default for DomainMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher_with(values: &[&str]) -> DomainMatcher {
        let selectors: Vec<Selector> = values.iter().map(|v| Selector::new(v)).collect();
        let m = DomainMatcher::new();
        m.update(&selectors);
        m
    }

    // ==================== Suffix ====================

    #[test]
    fn test_suffix_match_basic() {
        let m = matcher_with(&["example.com", "domain:google.com"]);

        assert!(m.matches("example.com"));
        assert!(m.matches("a.example.com"));
        assert!(m.matches("a.b.example.com"));
        assert!(!m.matches("notexample.com"));
        assert!(m.matches("google.com"));
        assert!(m.matches("mail.google.com"));
        assert!(!m.matches("oogle.com"));
    }

    #[test]
    fn test_suffix_deep_subdomain() {
        let m = matcher_with(&["example.com"]);
        assert!(m.matches("very.deep.subdomain.example.com"));
    }

    // ==================== Exact ====================

    #[test]
    fn test_full_match_only_exact() {
        let m = matcher_with(&["full:example.com"]);

        assert!(m.matches("example.com"));
        assert!(!m.matches("www.example.com"));
        assert!(!m.matches("sub.example.com"));
    }

    // ==================== Keyword ====================

    #[test]
    fn test_keyword_match() {
        let m = matcher_with(&["keyword:tube"]);

        assert!(m.matches("youtube.com"));
        assert!(m.matches("tubedomain.org"));
        assert!(!m.matches("google.com"));
    }

    #[test]
    fn test_keyword_case_insensitive_against_lowered_name() {
        // Pattern case is preserved in storage but compiled lowercase.
        let m = matcher_with(&["keyword:Tube"]);
        assert!(m.matches("youtube.com"));
    }

    // ==================== Regexp ====================

    #[test]
    fn test_regexp_match() {
        let m = matcher_with(&[r"regexp:^.+\.google\.com$"]);

        assert!(m.matches("mail.google.com"));
        assert!(m.matches("a.b.google.com"));
        assert!(!m.matches("google.com"));
        assert!(!m.matches("notgoogle.com"));
    }

    #[test]
    fn test_invalid_regexp_dropped_silently() {
        let m = matcher_with(&["regexp:[unclosed", "example.com"]);

        // The invalid expression matches nothing and does not reject the
        // other rules.
        assert!(m.matches("example.com"));
        assert!(!m.matches("unclosed"));
        assert_eq!(m.stats().regexps, 0);
        assert_eq!(m.stats().suffixes, 1);
    }

    // ==================== Non-domain selectors ====================

    #[test]
    fn test_ip_and_cidr_ignored() {
        let m = matcher_with(&["1.2.3.4", "10.0.0.0/8", "example.com"]);

        assert!(!m.matches("1.2.3.4"));
        assert!(m.matches("example.com"));
        let stats = m.stats();
        assert_eq!(stats.suffixes, 1);
        assert_eq!(stats.exact + stats.keywords + stats.regexps, 0);
    }

    // ==================== Empty / update ====================

    #[test]
    fn test_empty_matcher() {
        let m = DomainMatcher::new();
        assert!(!m.matches("example.com"));
        assert!(!m.matches(""));
    }

    #[test]
    fn test_update_replaces_rules() {
        let m = matcher_with(&["old.net"]);
        assert!(m.matches("old.net"));

        m.update(&[Selector::new("new.net")]);
        assert!(!m.matches("old.net"));
        assert!(m.matches("new.net"));
    }

    #[test]
    fn test_update_to_empty() {
        let m = matcher_with(&["example.com"]);
        m.update(&[]);
        assert!(!m.matches("example.com"));
    }

    #[test]
    fn test_stats() {
        let m = matcher_with(&[
            "a.com",
            "b.com",
            "full:c.com",
            "keyword:tube",
            r"regexp:.*\.cn$",
        ]);
        let stats = m.stats();
        assert_eq!(stats.suffixes, 2);
        assert_eq!(stats.exact, 1);
        assert_eq!(stats.keywords, 1);
        assert_eq!(stats.regexps, 1);
    }

    // ==================== Concurrent publication ====================

    #[test]
    fn test_readers_see_complete_snapshots() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let m = StdArc::new(matcher_with(&["stable.net"]));

        let reader = {
            let m = StdArc::clone(&m);
            thread::spawn(move || {
                for _ in 0..10_000 {
                    // Either ruleset matches stable.net; a torn snapshot
                    // would be the only way to observe false.
                    assert!(m.matches("stable.net"));
                }
            })
        };

        for i in 0..200 {
            m.update(&[
                Selector::new("stable.net"),
                Selector::new(&format!("churn{i}.net")),
            ]);
        }

        reader.join().unwrap();
    }
}
