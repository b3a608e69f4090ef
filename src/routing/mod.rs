//! Traffic redirection modes
//!
//! A [`Mode`] owns the netfilter topology that sends traffic whose
//! destination is in the address set to the downstream transparent proxy.
//! The redirect mode (NAT REDIRECT for TCP, TPROXY for UDP) is the
//! implementation used on the gateway; the trait keeps the reconciler and
//! the interface-state hooks independent of the mechanism.

pub mod iface;
pub mod redirect;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RoutingMode};
use crate::netfilter::NetfilterResult;

pub use iface::InterfaceMode;
pub use redirect::RedirectMode;

/// Mechanism for redirecting traffic matching the address sets
#[async_trait]
pub trait Mode: Send + Sync {
    /// Mode identifier for logs and status
    fn name(&self) -> &str;

    /// Install the redirection topology
    async fn setup_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()>;

    /// Remove everything installed by `setup_rules`, tolerating missing
    /// parts
    async fn teardown_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()>;

    /// Whether the downstream proxy appears to be reachable
    async fn is_active(&self, cancel: &CancellationToken) -> bool;
}

/// The mode selected by the configuration
#[must_use]
pub fn from_config(config: &Config) -> Arc<dyn Mode> {
    match config.routing.mode {
        RoutingMode::Redirect => Arc::new(RedirectMode::new(config)),
        RoutingMode::Interface => Arc::new(InterfaceMode::new(config)),
    }
}
