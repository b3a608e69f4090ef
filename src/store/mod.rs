//! Persistent selector-bundle store
//!
//! Bundles live in a single JSON document on disk. Every operation acquires
//! the store mutex and performs load-modify-save, so external edits to the
//! file are picked up on the next operation and mutations never interleave.
//! The store notifies nobody; callers invoke the reconciler after a
//! successful mutation.

pub mod bundle;
pub mod selector;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

pub use bundle::Bundle;
pub use selector::{is_v6_entry, normalize, Selector, SelectorKind};

/// Name of the bundle created on first run
pub const DEFAULT_BUNDLE_NAME: &str = "Default";

/// On-disk document shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct BundlesFile {
    bundles: Vec<Bundle>,
}

/// File-backed bundle store with a process-wide mutation lock
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Create a store reading and writing the given file path
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List all bundles
    pub fn list(&self) -> Result<Vec<Bundle>, StoreError> {
        let _guard = self.lock.lock();
        self.load()
    }

    /// Get a bundle by name
    pub fn get(&self, name: &str) -> Result<Bundle, StoreError> {
        let _guard = self.lock.lock();
        self.load()?
            .into_iter()
            .find(|b| b.name == name)
            .ok_or_else(|| StoreError::BundleNotFound(name.to_string()))
    }

    /// Add a new bundle. Fails if the name is taken.
    pub fn create(&self, bundle: Bundle) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        if bundles.iter().any(|b| b.name == bundle.name) {
            return Err(StoreError::BundleExists(bundle.name));
        }
        bundles.push(bundle);
        self.save(&bundles)
    }

    /// Replace an existing bundle entirely
    pub fn update(&self, bundle: Bundle) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        match bundles.iter_mut().find(|b| b.name == bundle.name) {
            Some(slot) => {
                *slot = bundle;
                self.save(&bundles)
            }
            None => Err(StoreError::BundleNotFound(bundle.name)),
        }
    }

    /// Delete a bundle by name
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        let before = bundles.len();
        bundles.retain(|b| b.name != name);
        if bundles.len() == before {
            return Err(StoreError::BundleNotFound(name.to_string()));
        }
        self.save(&bundles)
    }

    /// Add a selector to a bundle, deduplicating by normalised value
    pub fn add_selector(&self, bundle_name: &str, raw: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        let bundle = bundles
            .iter_mut()
            .find(|b| b.name == bundle_name)
            .ok_or_else(|| StoreError::BundleNotFound(bundle_name.to_string()))?;
        if !bundle.add_selector(raw) {
            return Err(StoreError::selector_exists(bundle_name, raw));
        }
        self.save(&bundles)
    }

    /// Remove a selector from a bundle by value
    pub fn remove_selector(&self, bundle_name: &str, raw: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        let bundle = bundles
            .iter_mut()
            .find(|b| b.name == bundle_name)
            .ok_or_else(|| StoreError::BundleNotFound(bundle_name.to_string()))?;
        if !bundle.remove_selector(raw) {
            return Err(StoreError::selector_not_found(bundle_name, raw));
        }
        self.save(&bundles)
    }

    /// Enable or disable a bundle
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        let bundle = bundles
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| StoreError::BundleNotFound(name.to_string()))?;
        bundle.enabled = enabled;
        self.save(&bundles)
    }

    /// The de-duplicated snapshot of enabled selectors.
    ///
    /// Walks bundles in insertion order, yielding each selector of every
    /// enabled bundle, deduplicating by normalised value, stable first-wins.
    /// This is the sole input to all downstream reconciliation.
    pub fn enabled_selectors(&self) -> Result<Vec<Selector>, StoreError> {
        let _guard = self.lock.lock();
        let bundles = self.load()?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for bundle in bundles.iter().filter(|b| b.enabled) {
            for sel in &bundle.selectors {
                let key = normalize(&sel.value);
                if seen.insert(key) {
                    out.push(sel.clone());
                }
            }
        }
        Ok(out)
    }

    /// Export all bundles as a JSON document
    pub fn export(&self) -> Result<String, StoreError> {
        let _guard = self.lock.lock();
        let bundles = self.load()?;
        serde_json::to_string_pretty(&BundlesFile { bundles })
            .map_err(|e| StoreError::ParseError(e.to_string()))
    }

    /// Export a single bundle as a JSON document
    pub fn export_bundle(&self, name: &str) -> Result<String, StoreError> {
        let bundle = self.get(name)?;
        serde_json::to_string_pretty(&BundlesFile {
            bundles: vec![bundle],
        })
        .map_err(|e| StoreError::ParseError(e.to_string()))
    }

    /// Import bundles from a JSON document, merging by name: same-named
    /// bundles are replaced, new names appended.
    pub fn import(&self, data: &str) -> Result<(), StoreError> {
        let imported: BundlesFile =
            serde_json::from_str(data).map_err(|e| StoreError::ParseError(e.to_string()))?;

        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        for incoming in imported.bundles {
            match bundles.iter_mut().find(|b| b.name == incoming.name) {
                Some(slot) => *slot = incoming,
                None => bundles.push(incoming),
            }
        }
        self.save(&bundles)
    }

    /// Create the default bundle when the store is empty (first run)
    pub fn ensure_default(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut bundles = self.load()?;
        if !bundles.is_empty() {
            return Ok(());
        }
        debug!(name = DEFAULT_BUNDLE_NAME, "creating default bundle");
        bundles.push(Bundle::new(DEFAULT_BUNDLE_NAME));
        self.save(&bundles)
    }

    fn load(&self) -> Result<Vec<Bundle>, StoreError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: BundlesFile =
            serde_json::from_str(&data).map_err(|e| StoreError::ParseError(e.to_string()))?;
        Ok(file.bundles)
    }

    fn save(&self, bundles: &[Bundle]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let data = serde_json::to_string_pretty(&BundlesFile {
            bundles: bundles.to_vec(),
        })
        .map_err(|e| StoreError::ParseError(e.to_string()))?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}
