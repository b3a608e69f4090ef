//! Kernel driver layer: ipset address sets and iptables rule management
//!
//! Both drivers speak to the kernel exclusively through subprocess
//! invocations of the canonical utilities, parsing their textual output.
//! The contracts that matter to callers are idempotence (add/del/create
//! tolerate the current state) and non-fatality (the reconciler logs driver
//! failures and continues; the next pass converges).

pub mod error;
pub mod exec;
pub mod ipset;
pub mod iptables;

pub use error::{NetfilterError, NetfilterResult};
pub use ipset::{AddrSet, IpSet, SetFamily};
pub use iptables::{Family, RuleDriver};

#[cfg(test)]
pub(crate) mod testutil {
    //! In-memory `AddrSet` used by tracker and reconciler tests.

    use std::collections::BTreeSet;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::{AddrSet, NetfilterResult};

    /// Recording fake of a kernel address set
    #[derive(Debug, Default)]
    pub struct MockAddrSet {
        name: String,
        pub members: Mutex<BTreeSet<String>>,
        pub flush_calls: Mutex<usize>,
        pub ensure_calls: Mutex<usize>,
    }

    impl MockAddrSet {
        pub fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Self::default()
            })
        }

        pub fn contains(&self, entry: &str) -> bool {
            self.members.lock().contains(entry)
        }

        pub fn len(&self) -> usize {
            self.members.lock().len()
        }
    }

    #[async_trait]
    impl AddrSet for MockAddrSet {
        fn name(&self) -> &str {
            &self.name
        }

        async fn ensure_table(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
            *self.ensure_calls.lock() += 1;
            Ok(())
        }

        async fn add(&self, _cancel: &CancellationToken, entry: &str) -> NetfilterResult<()> {
            self.members.lock().insert(entry.to_string());
            Ok(())
        }

        async fn del(&self, _cancel: &CancellationToken, entry: &str) -> NetfilterResult<()> {
            self.members.lock().remove(entry);
            Ok(())
        }

        async fn flush(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
            self.members.lock().clear();
            *self.flush_calls.lock() += 1;
            Ok(())
        }

        async fn list(&self, _cancel: &CancellationToken) -> NetfilterResult<Vec<String>> {
            Ok(self.members.lock().iter().cloned().collect())
        }

        async fn count(&self, _cancel: &CancellationToken) -> NetfilterResult<usize> {
            Ok(self.members.lock().len())
        }

        async fn destroy(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
            self.members.lock().clear();
            Ok(())
        }
    }
}
