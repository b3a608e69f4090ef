//! bypass-router daemon entry point
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! bypass-router
//!
//! # Run with an explicit configuration file
//! bypass-router -c /opt/etc/bypass-router/config.json
//!
//! # Validate configuration and exit
//! bypass-router --check
//! ```
//!
//! Exit codes: 0 on clean shutdown, 1 on startup failure, 2 on an
//! unrecoverable runtime error.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use bypass_router::config::{create_default_config, load_config_with_env, Config};
use bypass_router::daemon::Daemon;
use bypass_router::logbuf::{BufferLayer, LogBuffer};

const DEFAULT_CONFIG_PATH: &str = "/opt/etc/bypass-router/config.json";

/// Command-line arguments
struct Args {
    config_path: PathBuf,
    generate_config: bool,
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = std::env::var("BYPASS_ROUTER_CONFIG")
            .map_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("bypass-router v{}", bypass_router::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"bypass-router v{}

Selective-traffic router: DNS-driven ipset population and netfilter
redirection to a local transparent proxy.

USAGE:
    bypass-router [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: {DEFAULT_CONFIG_PATH}]
    -g, --generate-config   Write a default configuration and exit
    --check                 Validate configuration and exit
    -h, --help              Print help
    -v, --version           Print version

ENVIRONMENT:
    BYPASS_ROUTER_CONFIG       Configuration file path override
    BYPASS_ROUTER_LOG_LEVEL    Log level override (trace, debug, info, warn, error)
    RUST_LOG                   Fine-grained tracing filter

REQUIREMENTS:
    - Linux kernel with ipset and iptables; TPROXY for the UDP path
    - A transparent proxy listening on the configured local port
    - An upstream resolver on the configured loopback port
"#,
        bypass_router::VERSION
    );
}

/// Initialise the two log sinks: stderr and the control-panel ring buffer
fn init_logging(config: &Config, logbuf: &Arc<LogBuffer>) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tokio=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(BufferLayer::new(Arc::clone(logbuf), level))
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        match create_default_config(&args.config_path) {
            Ok(()) => {
                println!("Generated default configuration at {}", args.config_path.display());
                return;
            }
            Err(e) => {
                eprintln!("Failed to generate configuration: {e}");
                std::process::exit(1);
            }
        }
    }

    let config = match load_config_with_env(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from {}: {e}",
                args.config_path.display()
            );
            std::process::exit(1);
        }
    };

    if args.check_config {
        println!("Configuration is valid");
        return;
    }

    let logbuf = LogBuffer::new();
    init_logging(&config, &logbuf);

    info!(
        version = bypass_router::VERSION,
        config = %args.config_path.display(),
        "bypass-router starting"
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let daemon = Daemon::new(config, logbuf);
    if let Err(e) = daemon.run(cancel).await {
        error!(error = %e, "daemon failed");
        std::process::exit(e.exit_code());
    }
}

/// Cancel the token on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, initiating shutdown");
            }
            () = wait_for_sigterm() => {
                info!("received SIGTERM, initiating shutdown");
            }
        }
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
