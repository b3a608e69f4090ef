//! NAT REDIRECT + TPROXY redirection mode
//!
//! Works with any transparent proxy listening on a local port (ss-redir,
//! xray dokodemo-door, sing-box).
//!
//! Traffic flow:
//!
//! 1. DNS query resolved → address added to the set by the interceptor
//! 2. TCP: NAT `PREROUTING` → `BYPASS` chain → `REDIRECT --to-port N`
//! 3. UDP: mangle `PREROUTING` → `BYPASS_UDP` chain → `TPROXY` with mark
//!    `0x1`, policy-routed to loopback via table `100`
//! 4. Port-53 traffic on the ingress interface is captured to the local
//!    interceptor
//!
//! The UDP path and the whole v6 mirror are best-effort: kernels without
//! the TPROXY extension or ip6 NAT lose that sub-path with a warning while
//! the rest keeps working.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Mode;
use crate::config::Config;
use crate::netfilter::exec::run_silent;
use crate::netfilter::{NetfilterResult, RuleDriver};

const TCP_CHAIN: &str = "BYPASS";
const UDP_CHAIN: &str = "BYPASS_UDP";
const TCP_CHAIN6: &str = "BYPASS6";
const UDP_CHAIN6: &str = "BYPASS6_UDP";

const FWMARK: &str = "0x1";
const ROUTE_TABLE: &str = "100";

/// Fallback DNS-capture interface when none is configured
const DEFAULT_DNS_IFACE: &str = "br0";

/// Probe timeout for the downstream proxy port
const ACTIVE_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Redirect-to-local-port mode
pub struct RedirectMode {
    set_name: String,
    set_name6: String,
    local_port: String,
    iface: String,
    excluded4: Vec<String>,
    excluded6: Vec<String>,
    ipv6: bool,
    ipt4: RuleDriver,
    ipt6: RuleDriver,
}

impl RedirectMode {
    /// Build the mode from configuration
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let (excluded4, excluded6) = classify_networks(&config.excluded_networks);
        Self {
            set_name: config.ipset.table_name.clone(),
            set_name6: config.table_name6(),
            local_port: config.routing.local_port.to_string(),
            iface: config.network.ingress_interface.clone(),
            excluded4,
            excluded6,
            ipv6: config.ipv6,
            ipt4: RuleDriver::new(),
            ipt6: RuleDriver::new_v6(),
        }
    }

    fn dns_iface(&self) -> &str {
        if self.iface.is_empty() {
            DEFAULT_DNS_IFACE
        } else {
            &self.iface
        }
    }

    /// Install the TCP REDIRECT chain and its PREROUTING jump for one
    /// family.
    async fn setup_tcp(
        &self,
        cancel: &CancellationToken,
        ipt: &RuleDriver,
        chain: &str,
        set_name: &str,
        excluded: &[String],
    ) -> NetfilterResult<()> {
        ipt.create_chain(cancel, "nat", chain).await?;

        for net in excluded {
            if let Err(e) = ipt
                .append_rule(cancel, "nat", &[chain, "-d", net, "-j", "RETURN"])
                .await
            {
                ipt.delete_chain(cancel, "nat", chain).await.ok();
                return Err(e);
            }
        }

        if let Err(e) = ipt
            .append_rule(
                cancel,
                "nat",
                &[
                    chain,
                    "-p",
                    "tcp",
                    "-m",
                    "set",
                    "--match-set",
                    set_name,
                    "dst",
                    "-j",
                    "REDIRECT",
                    "--to-port",
                    &self.local_port,
                ],
            )
            .await
        {
            ipt.delete_chain(cancel, "nat", chain).await.ok();
            return Err(e);
        }

        let jump = self.prerouting_jump(chain);
        let jump: Vec<&str> = jump.iter().map(String::as_str).collect();
        if let Err(e) = ipt.append_rule(cancel, "nat", &jump).await {
            ipt.delete_chain(cancel, "nat", chain).await.ok();
            return Err(e);
        }
        Ok(())
    }

    /// Install the UDP TPROXY chain, jump, and policy routing for one
    /// family. On any failure the chain is deleted and the error returned;
    /// the caller degrades to TCP-only.
    async fn setup_udp_tproxy(
        &self,
        cancel: &CancellationToken,
        ipt: &RuleDriver,
        chain: &str,
        set_name: &str,
        excluded: &[String],
        v6: bool,
    ) -> NetfilterResult<()> {
        ipt.create_chain(cancel, "mangle", chain).await?;

        for net in excluded {
            if let Err(e) = ipt
                .append_rule(cancel, "mangle", &[chain, "-d", net, "-j", "RETURN"])
                .await
            {
                ipt.delete_chain(cancel, "mangle", chain).await.ok();
                return Err(e);
            }
        }

        let mark = format!("{FWMARK}/{FWMARK}");
        if let Err(e) = ipt
            .append_rule(
                cancel,
                "mangle",
                &[
                    chain,
                    "-p",
                    "udp",
                    "-m",
                    "set",
                    "--match-set",
                    set_name,
                    "dst",
                    "-j",
                    "TPROXY",
                    "--on-port",
                    &self.local_port,
                    "--tproxy-mark",
                    &mark,
                ],
            )
            .await
        {
            // TPROXY target not supported on this kernel.
            ipt.delete_chain(cancel, "mangle", chain).await.ok();
            return Err(e);
        }

        let jump = self.prerouting_jump(chain);
        let jump: Vec<&str> = jump.iter().map(String::as_str).collect();
        if let Err(e) = ipt.append_rule(cancel, "mangle", &jump).await {
            ipt.delete_chain(cancel, "mangle", chain).await.ok();
            return Err(e);
        }

        // Policy routing for TPROXY-marked packets.
        let (rule_args, route_args): (Vec<&str>, Vec<&str>) = if v6 {
            (
                vec!["-6", "rule", "add", "fwmark", FWMARK, "table", ROUTE_TABLE],
                vec![
                    "-6", "route", "replace", "local", "::/0", "dev", "lo", "table", ROUTE_TABLE,
                ],
            )
        } else {
            (
                vec!["rule", "add", "fwmark", FWMARK, "table", ROUTE_TABLE],
                vec![
                    "route", "replace", "local", "0/0", "dev", "lo", "table", ROUTE_TABLE,
                ],
            )
        };

        if let Err(e) = run_silent(cancel, "ip", &rule_args).await {
            // Usually means the rule already exists.
            warn!(error = %e, "fwmark rule add failed");
        }
        if let Err(e) = run_silent(cancel, "ip", &route_args).await {
            ipt.delete_chain(cancel, "mangle", chain).await.ok();
            return Err(e);
        }

        Ok(())
    }

    /// Capture port-53 traffic on the ingress interface to the local
    /// interceptor.
    async fn setup_dns_capture(&self, cancel: &CancellationToken, ipt: &RuleDriver, target: &str) {
        let dns_iface = self.dns_iface();
        for proto in ["udp", "tcp"] {
            if let Err(e) = ipt
                .append_rule(
                    cancel,
                    "nat",
                    &[
                        "PREROUTING",
                        "-i",
                        dns_iface,
                        "-p",
                        proto,
                        "--dport",
                        "53",
                        "-j",
                        "DNAT",
                        "--to",
                        target,
                    ],
                )
                .await
            {
                warn!(proto, error = %e, "dns capture rule failed");
            }
        }
    }

    async fn teardown_dns_capture(&self, cancel: &CancellationToken, ipt: &RuleDriver, target: &str) {
        let dns_iface = self.dns_iface();
        for proto in ["udp", "tcp"] {
            ipt.delete_rule(
                cancel,
                "nat",
                &[
                    "PREROUTING",
                    "-i",
                    dns_iface,
                    "-p",
                    proto,
                    "--dport",
                    "53",
                    "-j",
                    "DNAT",
                    "--to",
                    target,
                ],
            )
            .await
            .ok();
        }
    }

    /// Mirror the v4 setup with ip6tables; any failure aborts only the v6
    /// path.
    async fn setup_v6(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        self.setup_tcp(cancel, &self.ipt6, TCP_CHAIN6, &self.set_name6, &self.excluded6)
            .await?;

        if let Err(e) = self
            .setup_udp_tproxy(
                cancel,
                &self.ipt6,
                UDP_CHAIN6,
                &self.set_name6,
                &self.excluded6,
                true,
            )
            .await
        {
            warn!(error = %e, "IPv6 UDP TPROXY not available");
        }

        self.setup_dns_capture(cancel, &self.ipt6, "[::1]").await;
        Ok(())
    }

    fn prerouting_jump(&self, chain: &str) -> Vec<String> {
        if self.iface.is_empty() {
            vec!["PREROUTING".into(), "-j".into(), chain.into()]
        } else {
            vec![
                "PREROUTING".into(),
                "-i".into(),
                self.iface.clone(),
                "-j".into(),
                chain.into(),
            ]
        }
    }
}

#[async_trait]
impl Mode for RedirectMode {
    fn name(&self) -> &str {
        "redirect"
    }

    async fn setup_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        let iface = if self.iface.is_empty() { "<all>" } else { &self.iface };
        info!(
            set = %self.set_name,
            port = %self.local_port,
            iface,
            ipv6 = self.ipv6,
            "setting up redirect rules"
        );

        self.setup_tcp(cancel, &self.ipt4, TCP_CHAIN, &self.set_name, &self.excluded4)
            .await?;

        if let Err(e) = self
            .setup_udp_tproxy(
                cancel,
                &self.ipt4,
                UDP_CHAIN,
                &self.set_name,
                &self.excluded4,
                false,
            )
            .await
        {
            warn!(error = %e, "UDP TPROXY not available, only TCP will be proxied");
        }

        self.setup_dns_capture(cancel, &self.ipt4, "127.0.0.1").await;

        if self.ipv6 {
            if let Err(e) = self.setup_v6(cancel).await {
                warn!(error = %e, "IPv6 rules not available, only IPv4 traffic will be proxied");
            }
        }

        Ok(())
    }

    async fn teardown_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        info!("tearing down redirect rules");

        // v4 TCP
        self.ipt4
            .remove_jump_rules(cancel, "nat", "PREROUTING", TCP_CHAIN)
            .await
            .ok();
        self.ipt4.delete_chain(cancel, "nat", TCP_CHAIN).await.ok();

        // v4 UDP
        self.ipt4
            .remove_jump_rules(cancel, "mangle", "PREROUTING", UDP_CHAIN)
            .await
            .ok();
        self.ipt4.delete_chain(cancel, "mangle", UDP_CHAIN).await.ok();

        // v4 policy routing
        run_silent(
            cancel,
            "ip",
            &["rule", "del", "fwmark", FWMARK, "table", ROUTE_TABLE],
        )
        .await
        .ok();
        run_silent(
            cancel,
            "ip",
            &["route", "del", "local", "0/0", "table", ROUTE_TABLE],
        )
        .await
        .ok();

        self.teardown_dns_capture(cancel, &self.ipt4, "127.0.0.1").await;

        // v6 mirror; teardown always attempts it so stale rules from a
        // previously-enabled v6 configuration are evicted too.
        self.ipt6
            .remove_jump_rules(cancel, "nat", "PREROUTING", TCP_CHAIN6)
            .await
            .ok();
        self.ipt6.delete_chain(cancel, "nat", TCP_CHAIN6).await.ok();
        self.ipt6
            .remove_jump_rules(cancel, "mangle", "PREROUTING", UDP_CHAIN6)
            .await
            .ok();
        self.ipt6
            .delete_chain(cancel, "mangle", UDP_CHAIN6)
            .await
            .ok();
        run_silent(
            cancel,
            "ip",
            &["-6", "rule", "del", "fwmark", FWMARK, "table", ROUTE_TABLE],
        )
        .await
        .ok();
        run_silent(
            cancel,
            "ip",
            &["-6", "route", "del", "local", "::/0", "table", ROUTE_TABLE],
        )
        .await
        .ok();
        self.teardown_dns_capture(cancel, &self.ipt6, "[::1]").await;

        Ok(())
    }

    async fn is_active(&self, _cancel: &CancellationToken) -> bool {
        let addr: SocketAddr = match format!("127.0.0.1:{}", self.local_port).parse() {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(ACTIVE_PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Split configured CIDRs into v4 and v6 groups; invalid entries are
/// dropped (validation rejects them at startup).
fn classify_networks(networks: &[String]) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for net in networks {
        match net.parse::<IpNet>() {
            Ok(IpNet::V4(_)) => v4.push(net.clone()),
            Ok(IpNet::V6(_)) => v6.push(net.clone()),
            Err(_) => {}
        }
    }
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_networks() {
        let networks = vec![
            "10.0.0.0/8".to_string(),
            "fd00::/8".to_string(),
            "192.168.0.0/16".to_string(),
            "garbage".to_string(),
        ];
        let (v4, v6) = classify_networks(&networks);
        assert_eq!(v4, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(v6, vec!["fd00::/8"]);
    }

    #[test]
    fn test_prerouting_jump_scoping() {
        let mut config = Config::default();
        let mode = RedirectMode::new(&config);
        assert_eq!(mode.prerouting_jump("BYPASS"), vec!["PREROUTING", "-j", "BYPASS"]);

        config.network.ingress_interface = "br0".into();
        let mode = RedirectMode::new(&config);
        assert_eq!(
            mode.prerouting_jump("BYPASS"),
            vec!["PREROUTING", "-i", "br0", "-j", "BYPASS"]
        );
    }

    #[test]
    fn test_dns_iface_fallback() {
        let mut config = Config::default();
        let mode = RedirectMode::new(&config);
        assert_eq!(mode.dns_iface(), "br0");

        config.network.ingress_interface = "eth1".into();
        let mode = RedirectMode::new(&config);
        assert_eq!(mode.dns_iface(), "eth1");
    }

    #[test]
    fn test_mode_name_and_set_names() {
        let config = Config::default();
        let mode = RedirectMode::new(&config);
        assert_eq!(mode.name(), "redirect");
        assert_eq!(mode.set_name, "bypass");
        assert_eq!(mode.set_name6, "bypass6");
    }

    #[tokio::test]
    async fn test_is_active_detects_listener() {
        // Nothing listens on the default port in the test environment.
        let config = Config::default();
        let mode = RedirectMode::new(&config);
        let cancel = CancellationToken::new();
        assert!(!mode.is_active(&cancel).await);

        // Point the probe at a live listener.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.routing.local_port = listener.local_addr().unwrap().port();
        let mode = RedirectMode::new(&config);
        assert!(mode.is_active(&cancel).await);
    }
}
