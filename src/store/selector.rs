//! Selector values: domains, domain patterns, IPs, and CIDRs
//!
//! A selector is one host targeting rule. Its textual value may carry a type
//! prefix (`domain:`, `full:`, `keyword:`, `regexp:`); without one the value
//! is a bare domain, unless it parses as an IP literal or CIDR.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Classified kind of a selector value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorKind {
    /// `example.com` or `domain:example.com` — the name and every
    /// dot-separated left-extension
    DomainSuffix,
    /// `full:example.com` — exactly this name
    DomainFull,
    /// `keyword:tube` — any name containing the substring
    DomainKeyword,
    /// `regexp:<expr>` — any name the expression matches
    DomainRegexp,
    /// IPv4/IPv6 literal, entered into the address set directly
    Ip,
    /// CIDR, entered into the address set directly
    Cidr,
}

/// A single host targeting rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector {
    /// The textual value, stored normalised
    pub value: String,
}

impl Selector {
    /// Create a selector from raw user input, normalising the value
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self {
            value: normalize(raw),
        }
    }

    /// Detect the kind of this selector
    #[must_use]
    pub fn kind(&self) -> SelectorKind {
        let v = self.value.as_str();
        if v.starts_with("domain:") {
            return SelectorKind::DomainSuffix;
        }
        if v.starts_with("full:") {
            return SelectorKind::DomainFull;
        }
        if v.starts_with("keyword:") {
            return SelectorKind::DomainKeyword;
        }
        if v.starts_with("regexp:") {
            return SelectorKind::DomainRegexp;
        }
        if v.parse::<IpNet>().is_ok() {
            return SelectorKind::Cidr;
        }
        if v.parse::<IpAddr>().is_ok() {
            return SelectorKind::Ip;
        }
        SelectorKind::DomainSuffix
    }

    /// True for the four domain kinds
    #[must_use]
    pub fn is_domain(&self) -> bool {
        matches!(
            self.kind(),
            SelectorKind::DomainSuffix
                | SelectorKind::DomainFull
                | SelectorKind::DomainKeyword
                | SelectorKind::DomainRegexp
        )
    }

    /// True for IP and CIDR selectors
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.kind(), SelectorKind::Ip | SelectorKind::Cidr)
    }

    /// The value with any type prefix stripped
    #[must_use]
    pub fn domain_value(&self) -> &str {
        for prefix in ["domain:", "full:", "keyword:", "regexp:"] {
            if let Some(rest) = self.value.strip_prefix(prefix) {
                return rest;
            }
        }
        &self.value
    }

    /// Whether a direct (IP/CIDR) selector belongs to the v6 family.
    ///
    /// A value is v6 iff it parses as an IP without a 4-byte form, or as a
    /// CIDR whose base address has no 4-byte form. Returns false for
    /// domain selectors.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        if let Ok(net) = self.value.parse::<IpNet>() {
            return is_v6_addr(net.addr());
        }
        if let Ok(ip) = self.value.parse::<IpAddr>() {
            return is_v6_addr(ip);
        }
        false
    }
}

/// v6 iff the address has no 4-byte form (v4-mapped addresses count as v4)
pub(crate) fn is_v6_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(_) => false,
        IpAddr::V6(v6) => v6.to_ipv4_mapped().is_none(),
    }
}

/// Classify a plain address or CIDR string as v6. Used by the tracker for
/// DNS-resolved addresses, which never carry selector prefixes.
#[must_use]
pub fn is_v6_entry(entry: &str) -> bool {
    if let Ok(net) = entry.parse::<IpNet>() {
        return is_v6_addr(net.addr());
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return is_v6_addr(ip);
    }
    false
}

/// Normalise a raw selector value.
///
/// Trims whitespace, strips a URL scheme, strips path/query/fragment,
/// strips a port suffix, and lowercases. CIDRs are detected before the `/`
/// strip so the prefix length survives. Values under `keyword:` and
/// `regexp:` are preserved verbatim apart from trimming; `domain:` and
/// `full:` prefixes are retained with the remainder normalised.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let s = raw.trim();

    // Pattern kinds keep their case and inner characters.
    if s.starts_with("keyword:") || s.starts_with("regexp:") {
        return s.to_string();
    }

    for prefix in ["domain:", "full:"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            return format!("{prefix}{}", normalize_host(rest));
        }
    }

    normalize_host(s)
}

fn normalize_host(s: &str) -> String {
    let mut s = s.trim();

    // Strip URL scheme.
    if let Some(idx) = s.find("://") {
        s = &s[idx + 3..];
    }

    // CIDRs contain a '/' that must survive the path strip.
    if s.parse::<IpNet>().is_ok() {
        return s.to_ascii_lowercase();
    }

    // Strip path, query, fragment.
    if let Some(idx) = s.find('/') {
        s = &s[..idx];
    }

    strip_port(s).trim().to_ascii_lowercase()
}

/// Strip a `:port` suffix from a host, leaving bare IPv6 literals intact.
fn strip_port(s: &str) -> &str {
    // Bracketed form: [host]:port or [host]
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return s;
    }

    // One colon with a numeric suffix is host:port; anything else (e.g. a
    // raw IPv6 literal) is left alone.
    let mut parts = s.splitn(2, ':');
    let host = parts.next().unwrap_or(s);
    match parts.next() {
        Some(port)
            if !port.is_empty() && !port.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => s,
    }
}
