//! Named, toggleable selector bundles

use serde::{Deserialize, Serialize};

use super::selector::{normalize, Selector};

/// A named, enabled/disabled collection of selectors.
///
/// Invariants: bundle names are unique within the store; selectors within a
/// bundle are unique after normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Unique bundle name
    pub name: String,

    /// Optional human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether this bundle contributes to the enabled snapshot
    pub enabled: bool,

    /// Optional reference to the external curated list this bundle was
    /// derived from (e.g. `geosite:netflix`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// The bundle's selectors
    #[serde(default)]
    pub selectors: Vec<Selector>,
}

impl Bundle {
    /// Create an empty enabled bundle
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            source: None,
            selectors: Vec::new(),
        }
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the source tag
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Check whether the bundle contains a selector, comparing by
    /// normalised value.
    #[must_use]
    pub fn has_selector(&self, raw: &str) -> bool {
        let value = normalize(raw);
        self.selectors.iter().any(|s| normalize(&s.value) == value)
    }

    /// Add a selector if absent. Returns true when added.
    pub fn add_selector(&mut self, raw: &str) -> bool {
        if self.has_selector(raw) {
            return false;
        }
        self.selectors.push(Selector::new(raw));
        true
    }

    /// Remove a selector by value. Returns true when removed.
    pub fn remove_selector(&mut self, raw: &str) -> bool {
        let value = normalize(raw);
        let before = self.selectors.len();
        self.selectors.retain(|s| normalize(&s.value) != value);
        self.selectors.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_selector_normalises() {
        let mut b = Bundle::new("Test");
        assert!(b.add_selector("domain:Example.COM"));
        assert_eq!(b.selectors[0].value, "domain:example.com");

        // Pattern kinds keep their case.
        assert!(b.add_selector("keyword:Tube"));
        assert_eq!(b.selectors[1].value, "keyword:Tube");
    }

    #[test]
    fn test_add_selector_deduplicates() {
        let mut b = Bundle::new("Test");
        assert!(b.add_selector("example.com"));
        assert!(!b.add_selector("EXAMPLE.com"));
        assert!(!b.add_selector("https://example.com/path"));
        assert_eq!(b.selectors.len(), 1);
    }

    #[test]
    fn test_remove_selector() {
        let mut b = Bundle::new("Test");
        b.add_selector("example.com");
        b.add_selector("1.2.3.4");

        assert!(b.remove_selector("Example.com"));
        assert!(!b.remove_selector("example.com"));
        assert_eq!(b.selectors.len(), 1);
        assert_eq!(b.selectors[0].value, "1.2.3.4");
    }

    #[test]
    fn test_bundle_builders() {
        let b = Bundle::new("Streaming")
            .with_description("video services")
            .with_source("geosite:netflix");
        assert!(b.enabled);
        assert_eq!(b.description.as_deref(), Some("video services"));
        assert_eq!(b.source.as_deref(), Some("geosite:netflix"));
    }

    #[test]
    fn test_bundle_serde_roundtrip() {
        let mut b = Bundle::new("Test").with_source("list:custom");
        b.add_selector("example.com");
        b.add_selector("10.0.0.0/8");

        let json = serde_json::to_string(&b).unwrap();
        let back: Bundle = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "Test");
        assert_eq!(back.selectors.len(), 2);
        assert_eq!(back.source.as_deref(), Some("list:custom"));
        // None fields are omitted from the document entirely.
        assert!(!json.contains("description"));
    }
}
