//! bypass-router: selective-traffic router for Linux home gateways
//!
//! Given a user-curated set of host selectors (domains, domain patterns,
//! IPs, CIDRs) organised into named toggleable bundles, the router arranges
//! that matching egress traffic traverses a local transparent proxy while
//! everything else takes the default route.
//!
//! # Architecture
//!
//! ```text
//! Client DNS query → interceptor → upstream resolver
//!                        ↓ (matched name)
//!                     tracker → kernel address set
//!
//! Client TCP/UDP packet → netfilter chains (dst ∈ set) → local proxy port
//! ```
//!
//! Three moving parts are bound into a consistent whole by the reconciler:
//! the DNS interceptor that harvests resolved addresses of matched names,
//! the reference-counted tracker that mediates between the interceptor and
//! the kernel sets, and the rule programmer that installs the TCP REDIRECT,
//! UDP TPROXY, and port-53 capture topology.
//!
//! # Modules
//!
//! - [`config`]: configuration types and loading
//! - [`daemon`]: process lifecycle supervisor
//! - [`dns`]: UDP+TCP DNS interceptor and upstream exchange
//! - [`error`]: error types
//! - [`logbuf`]: in-memory log ring for the control panel
//! - [`netfilter`]: ipset and iptables drivers
//! - [`reconcile`]: full and mutation reconciliation
//! - [`routing`]: redirection modes (rule programmer)
//! - [`rules`]: domain matcher
//! - [`store`]: persistent selector bundles
//! - [`tracker`]: reference-counted domain ⇄ address map
//! - [`web`]: control-panel HTTP API

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod daemon;
pub mod dns;
pub mod error;
pub mod logbuf;
pub mod netfilter;
pub mod reconcile;
pub mod routing;
pub mod rules;
pub mod store;
pub mod tracker;
pub mod web;

pub use config::{load_config, load_config_with_env, Config};
pub use daemon::{Daemon, RunError};
pub use dns::{DnsError, Interceptor, QueryHandler, Resolver, Upstream};
pub use error::{BypassError, ConfigError, Result, StoreError};
pub use logbuf::{LogBuffer, LogEntry};
pub use netfilter::{AddrSet, IpSet, NetfilterError, RuleDriver};
pub use reconcile::Reconciler;
pub use routing::{InterfaceMode, Mode, RedirectMode};
pub use rules::{DomainMatcher, RuleStats};
pub use store::{Bundle, Selector, SelectorKind, Store};
pub use tracker::Tracker;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
