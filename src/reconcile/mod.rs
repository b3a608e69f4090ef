//! State reconciliation
//!
//! The reconciler sequences updates across the store snapshot, the matcher
//! ruleset, the kernel address sets, the tracker, and the netfilter rules.
//! Two entry points, both serialised under the reconciler mutex:
//!
//! **Full reconcile** — tear down and rebuild rules, flush the tracker (and
//! transitively both sets), repopulate direct IP/CIDR entries. DNS-resolved
//! addresses repopulate naturally as queries flow through the interceptor.
//!
//! **Mutation reconcile** — after a store mutation: diff the domain list
//! against the last-applied snapshot, release removed domains through the
//! tracker, replace the matcher ruleset, and add direct entries. Never
//! flushes sets, never touches rules.
//!
//! Driver failures are logged and skipped; only snapshot-load and mode
//! setup failures abort a pass, because they would leave the system in a
//! known-broken state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::netfilter::AddrSet;
use crate::routing::Mode;
use crate::rules::DomainMatcher;
use crate::store::{Selector, Store};
use crate::tracker::Tracker;

/// Orchestrates reconciliation between the store and the live state
pub struct Reconciler {
    store: Arc<Store>,
    matcher: Arc<DomainMatcher>,
    tracker: Arc<Tracker>,
    set4: Arc<dyn AddrSet>,
    set6: Option<Arc<dyn AddrSet>>,
    mode: Arc<dyn Mode>,
    /// Domain selector values from the most recent reconcile; guards the
    /// whole reconcile sequence and feeds removal diffs.
    last_domains: Mutex<HashSet<String>>,
}

impl Reconciler {
    /// Wire up a reconciler over the shared components
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        matcher: Arc<DomainMatcher>,
        tracker: Arc<Tracker>,
        set4: Arc<dyn AddrSet>,
        set6: Option<Arc<dyn AddrSet>>,
        mode: Arc<dyn Mode>,
    ) -> Self {
        Self {
            store,
            matcher,
            tracker,
            set4,
            set6,
            mode,
            last_domains: Mutex::new(HashSet::new()),
        }
    }

    /// Full reconcile: rules are rebuilt, the tracker is flushed, direct
    /// entries repopulated.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last = self.last_domains.lock().await;

        info!("starting full reconcile");

        let selectors = self.store.enabled_selectors()?;
        info!(count = selectors.len(), "loaded enabled selectors");

        self.matcher.update(&selectors);
        *last = domain_set(&selectors);

        self.ensure_tables(cancel).await?;

        // Clears stale membership; live DNS traffic repopulates naturally.
        self.tracker.flush(cancel).await;

        self.populate_direct(cancel, &selectors).await;

        // Teardown precedes setup to evict stale rules from configuration
        // changes (port, interface).
        self.mode.teardown_rules(cancel).await.ok();
        self.mode.setup_rules(cancel).await?;

        info!("full reconcile complete");
        Ok(())
    }

    /// Mutation reconcile: called after a successful store mutation.
    pub async fn apply_mutation(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last = self.last_domains.lock().await;

        let selectors = self.store.enabled_selectors()?;

        // Release domains that disappeared from the snapshot; their
        // addresses leave the sets as reference counts reach zero.
        let new_domains = domain_set(&selectors);
        for domain in last.iter() {
            if !new_domains.contains(domain) {
                self.tracker.remove_domain(cancel, domain).await;
            }
        }

        self.matcher.update(&selectors);
        *last = new_domains;

        self.ensure_tables(cancel).await?;
        self.populate_direct(cancel, &selectors).await;
        Ok(())
    }

    /// Install the redirection topology without reconciling anything else.
    /// Entry point for interface-state hooks.
    pub async fn setup_rules(&self, cancel: &CancellationToken) -> Result<()> {
        self.mode.setup_rules(cancel).await?;
        Ok(())
    }

    /// Remove the redirection topology. Entry point for interface-state
    /// hooks.
    pub async fn teardown_rules(&self, cancel: &CancellationToken) -> Result<()> {
        self.mode.teardown_rules(cancel).await?;
        Ok(())
    }

    /// The active mode, for status reporting
    #[must_use]
    pub fn mode(&self) -> &Arc<dyn Mode> {
        &self.mode
    }

    async fn ensure_tables(&self, cancel: &CancellationToken) -> Result<()> {
        self.set4.ensure_table(cancel).await?;
        if let Some(set6) = &self.set6 {
            set6.ensure_table(cancel).await?;
        }
        Ok(())
    }

    /// Add direct IP/CIDR selectors to the matching family's set. Domain
    /// selectors are handled by the interceptor at query time.
    async fn populate_direct(&self, cancel: &CancellationToken, selectors: &[Selector]) {
        for sel in selectors.iter().filter(|s| s.is_direct()) {
            let set = if sel.is_ipv6() {
                match &self.set6 {
                    Some(set6) => set6,
                    // v6 entries are skipped when v6 is disabled.
                    None => continue,
                }
            } else {
                &self.set4
            };
            if let Err(e) = set.add(cancel, &sel.value).await {
                warn!(entry = %sel.value, error = %e, "failed to add direct entry");
            }
        }
    }
}

/// The set of domain selector values in a snapshot
fn domain_set(selectors: &[Selector]) -> HashSet<String> {
    selectors
        .iter()
        .filter(|s| s.is_domain())
        .map(|s| s.value.clone())
        .collect()
}
