//! Reference-counted domain ⇄ address tracker
//!
//! The tracker is the single source of truth for which addresses sit in the
//! kernel sets as a consequence of DNS activity, and the sole agent issuing
//! add/del against those sets for DNS-derived entries. Reference counting
//! ensures an address is removed only when no interested domain remains.
//!
//! DNS TTL is deliberately ignored: entries persist until the domain is
//! explicitly removed or the tracker is flushed, so long-lived connections
//! are not rerouted mid-flight.
//!
//! The mutex protects the maps only; kernel-set propagation happens after
//! lock release. The set drivers are idempotent for adds and tolerant of
//! missing entries for deletes, so interleaving across unrelated addresses
//! does not affect correctness.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::netfilter::AddrSet;
use crate::store::is_v6_entry;

#[derive(Debug, Default)]
struct TrackerMaps {
    /// domain → addresses resolved for it (typically 1–4)
    forward: HashMap<String, Vec<String>>,
    /// address → domains referencing it (typically 1–2)
    reverse: HashMap<String, Vec<String>>,
}

/// Bidirectional reference-counted map feeding the kernel address sets
pub struct Tracker {
    maps: Mutex<TrackerMaps>,
    set4: Arc<dyn AddrSet>,
    set6: Option<Arc<dyn AddrSet>>,
}

impl Tracker {
    /// Create a tracker over the given kernel sets. `set6` is `None` when
    /// IPv6 handling is disabled; v6 addresses are then dropped silently.
    #[must_use]
    pub fn new(set4: Arc<dyn AddrSet>, set6: Option<Arc<dyn AddrSet>>) -> Self {
        Self {
            maps: Mutex::new(TrackerMaps::default()),
            set4,
            set6,
        }
    }

    /// Record an address for a domain and propagate it into the kernel set
    /// of the matching family.
    pub async fn track(&self, cancel: &CancellationToken, domain: &str, addr: &str) {
        let v6 = is_v6_entry(addr);
        if v6 && self.set6.is_none() {
            // No v6 set configured; the address never enters the maps.
            debug!(domain, addr, "dropping v6 address, ipv6 disabled");
            return;
        }

        let inserted = {
            let mut maps = self.maps.lock();
            let addrs = maps.forward.entry(domain.to_string()).or_default();
            if addrs.iter().any(|a| a == addr) {
                false
            } else {
                addrs.push(addr.to_string());
                let refs = maps.reverse.entry(addr.to_string()).or_default();
                if !refs.iter().any(|d| d == domain) {
                    refs.push(domain.to_string());
                }
                true
            }
        };

        // The add is issued even for already-tracked edges: the kernel entry
        // may have been lost independently, and the operation is idempotent.
        let _ = inserted;
        if let Err(e) = self.set_for(v6).add(cancel, addr).await {
            warn!(addr, error = %e, "tracker: address-set add failed");
        }
    }

    /// Drop every address recorded for a domain. Addresses whose reference
    /// count reaches zero are removed from the kernel set.
    pub async fn remove_domain(&self, cancel: &CancellationToken, domain: &str) {
        let to_remove: Vec<String> = {
            let mut maps = self.maps.lock();
            let Some(addrs) = maps.forward.remove(domain) else {
                return;
            };

            let mut unreferenced = Vec::new();
            for addr in addrs {
                if let Some(refs) = maps.reverse.get_mut(&addr) {
                    refs.retain(|d| d != domain);
                    if refs.is_empty() {
                        maps.reverse.remove(&addr);
                        unreferenced.push(addr);
                    }
                }
            }
            unreferenced
        };

        for addr in to_remove {
            let v6 = is_v6_entry(&addr);
            if let Err(e) = self.set_for(v6).del(cancel, &addr).await {
                warn!(addr, error = %e, "tracker: address-set del failed");
            }
        }
    }

    /// Reset both maps and flush both kernel sets.
    pub async fn flush(&self, cancel: &CancellationToken) {
        {
            let mut maps = self.maps.lock();
            maps.forward.clear();
            maps.reverse.clear();
        }

        if let Err(e) = self.set4.flush(cancel).await {
            warn!(error = %e, "tracker: v4 set flush failed");
        }
        if let Some(set6) = &self.set6 {
            if let Err(e) = set6.flush(cancel).await {
                warn!(error = %e, "tracker: v6 set flush failed");
            }
        }
    }

    /// Number of tracked domains and unique addresses
    #[must_use]
    pub fn count(&self) -> (usize, usize) {
        let maps = self.maps.lock();
        (maps.forward.len(), maps.reverse.len())
    }

    /// The domains currently referencing an address, for diagnostics
    #[must_use]
    pub fn domains_for(&self, addr: &str) -> Vec<String> {
        self.maps.lock().reverse.get(addr).cloned().unwrap_or_default()
    }

    /// The addresses currently recorded for a domain, for diagnostics
    #[must_use]
    pub fn addresses_for(&self, domain: &str) -> Vec<String> {
        self.maps.lock().forward.get(domain).cloned().unwrap_or_default()
    }

    fn set_for(&self, v6: bool) -> &Arc<dyn AddrSet> {
        if v6 {
            if let Some(set6) = &self.set6 {
                return set6;
            }
        }
        &self.set4
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (domains, addrs) = self.count();
        f.debug_struct("Tracker")
            .field("domains", &domains)
            .field("addresses", &addrs)
            .field("set4", &self.set4.name())
            .field("set6", &self.set6.as_ref().map(|s| s.name()))
            .finish()
    }
}
