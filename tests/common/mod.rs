//! Shared fakes for integration tests

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use bypass_router::netfilter::{AddrSet, NetfilterResult};
use bypass_router::routing::Mode;

/// In-memory stand-in for a kernel address set
#[derive(Debug, Default)]
pub struct FakeAddrSet {
    name: String,
    pub members: Mutex<BTreeSet<String>>,
    pub flush_calls: Mutex<usize>,
}

impl FakeAddrSet {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.members.lock().contains(entry)
    }

    pub fn members(&self) -> Vec<String> {
        self.members.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl AddrSet for FakeAddrSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
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
        Ok(self.members())
    }

    async fn count(&self, _cancel: &CancellationToken) -> NetfilterResult<usize> {
        Ok(self.members.lock().len())
    }

    async fn destroy(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
        self.members.lock().clear();
        Ok(())
    }
}

/// Mode recording setup/teardown call order
#[derive(Debug, Default)]
pub struct RecordingMode {
    pub calls: Mutex<Vec<&'static str>>,
}

impl RecordingMode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Mode for RecordingMode {
    fn name(&self) -> &str {
        "recording"
    }

    async fn setup_rules(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
        self.calls.lock().push("setup");
        Ok(())
    }

    async fn teardown_rules(&self, _cancel: &CancellationToken) -> NetfilterResult<()> {
        self.calls.lock().push("teardown");
        Ok(())
    }

    async fn is_active(&self, _cancel: &CancellationToken) -> bool {
        true
    }
}
