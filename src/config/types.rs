//! Configuration types
//!
//! The configuration is loaded once at startup, validated, and passed
//! explicitly; it is immutable for the process lifetime.

use std::net::SocketAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Traffic redirection settings
    #[serde(default)]
    pub routing: RoutingConfig,

    /// DNS interceptor settings
    #[serde(default)]
    pub dns: DnsConfig,

    /// Kernel address-set settings
    #[serde(default)]
    pub ipset: IpsetConfig,

    /// Gateway network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Destination networks never redirected (v4 and v6 CIDRs)
    #[serde(default = "default_excluded_networks")]
    pub excluded_networks: Vec<String>,

    /// Enable the IPv6 path (v6 address set, ip6tables rules, AAAA tracking)
    #[serde(default)]
    pub ipv6: bool,

    /// Control-panel HTTP settings
    #[serde(default)]
    pub web: WebConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,

    /// Directory holding the bundles file and PID file
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

/// Mechanism used to steer matched traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// NAT REDIRECT (TCP) and TPROXY (UDP) to a local proxy port
    Redirect,
    /// MARK + policy routing via a VPN tunnel interface
    Interface,
}

impl Default for RoutingMode {
    fn default() -> Self {
        Self::Redirect
    }
}

/// Traffic redirection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Steering mechanism
    #[serde(default)]
    pub mode: RoutingMode,

    /// Local port the downstream transparent proxy listens on
    /// (redirect mode)
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// VPN tunnel interface marked traffic is routed through
    /// (interface mode)
    #[serde(default)]
    pub interface: String,
}

/// DNS interceptor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DnsConfig {
    /// Endpoint the interceptor listens on (UDP + TCP)
    #[serde(default = "default_dns_listen")]
    pub listen: SocketAddr,

    /// Local port of the upstream encrypted resolver
    #[serde(default = "default_upstream_port")]
    pub upstream_port: u16,
}

/// Kernel address-set settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpsetConfig {
    /// Base set name; the v6 companion is `<table_name>6`
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

/// Gateway network settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Gateway-side ingress interface the redirect rules are scoped to.
    /// Empty means all interfaces (DNS capture then falls back to `br0`).
    #[serde(default)]
    pub ingress_interface: String,
}

/// Control-panel HTTP settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    /// Endpoint the control panel listens on
    #[serde(default = "default_web_listen")]
    pub listen: SocketAddr,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Minimum level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when a field is out of range
    /// or an excluded network is not a valid CIDR.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routing.local_port == 0 {
            return Err(ConfigError::ValidationError(
                "routing.local_port must be non-zero".into(),
            ));
        }
        if self.routing.mode == RoutingMode::Interface && self.routing.interface.is_empty() {
            return Err(ConfigError::ValidationError(
                "routing.interface is required in interface mode".into(),
            ));
        }
        if self.dns.upstream_port == 0 {
            return Err(ConfigError::ValidationError(
                "dns.upstream_port must be non-zero".into(),
            ));
        }
        if self.ipset.table_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "ipset.table_name must not be empty".into(),
            ));
        }
        for net in &self.excluded_networks {
            if net.parse::<IpNet>().is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "excluded network {net:?} is not a valid CIDR"
                )));
            }
        }
        Ok(())
    }

    /// The v6 companion set name
    #[must_use]
    pub fn table_name6(&self) -> String {
        format!("{}6", self.ipset.table_name)
    }

    /// The upstream resolver endpoint on loopback
    #[must_use]
    pub fn upstream_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.dns.upstream_port))
    }

    /// Path of the bundles file
    #[must_use]
    pub fn bundles_file(&self) -> PathBuf {
        self.state_dir.join("bundles.json")
    }

    /// Path of the PID file
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("bypass-router.pid")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            dns: DnsConfig::default(),
            ipset: IpsetConfig::default(),
            network: NetworkConfig::default(),
            excluded_networks: default_excluded_networks(),
            ipv6: false,
            web: WebConfig::default(),
            log: LogConfig::default(),
            state_dir: default_state_dir(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: RoutingMode::default(),
            local_port: default_local_port(),
            interface: String::new(),
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
            upstream_port: default_upstream_port(),
        }
    }
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            table_name: default_table_name(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_web_listen(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_local_port() -> u16 {
    1181
}

fn default_dns_listen() -> SocketAddr {
    "0.0.0.0:53".parse().unwrap()
}

fn default_upstream_port() -> u16 {
    9153
}

fn default_table_name() -> String {
    "bypass".into()
}

fn default_web_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/opt/etc/bypass-router")
}

fn default_excluded_networks() -> Vec<String> {
    vec![
        "10.0.0.0/8".into(),
        "172.16.0.0/12".into(),
        "192.168.0.0/16".into(),
    ]
}
