//! Configuration types and loading

pub mod loader;
pub mod types;

pub use loader::{create_default_config, load_config, load_config_with_env};
pub use types::{
    Config, DnsConfig, IpsetConfig, LogConfig, NetworkConfig, RoutingConfig, RoutingMode,
    WebConfig,
};
