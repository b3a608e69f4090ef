//! MARK + policy routing mode
//!
//! Works with any VPN that creates a tunnel interface (WireGuard `wg0`,
//! OpenVPN `tun0`). Packets destined for set members are marked in the
//! mangle table; a policy rule routes marked packets through an auxiliary
//! table whose default route points at the tunnel.
//!
//! This mode carries no DNS capture and no v6 mirror: clients are expected
//! to use the gateway resolver directly, and tunnel routing is v4-only.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::Mode;
use crate::config::Config;
use crate::netfilter::exec::run_silent;
use crate::netfilter::{NetfilterResult, RuleDriver};

const MARK_CHAIN: &str = "BYPASS_MARK";
const FWMARK: &str = "0x1";
const ROUTE_TABLE: &str = "100";

/// Mark-and-route-via-interface mode
pub struct InterfaceMode {
    set_name: String,
    ingress_iface: String,
    vpn_iface: String,
    excluded: Vec<String>,
    ipt: RuleDriver,
}

impl InterfaceMode {
    /// Build the mode from configuration
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            set_name: config.ipset.table_name.clone(),
            ingress_iface: config.network.ingress_interface.clone(),
            vpn_iface: config.routing.interface.clone(),
            excluded: config.excluded_networks.clone(),
            ipt: RuleDriver::new(),
        }
    }
}

#[async_trait]
impl Mode for InterfaceMode {
    fn name(&self) -> &str {
        "interface"
    }

    async fn setup_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        info!(
            set = %self.set_name,
            vpn_interface = %self.vpn_iface,
            "setting up mark rules"
        );

        self.ipt.create_chain(cancel, "mangle", MARK_CHAIN).await?;

        for net in &self.excluded {
            self.ipt
                .append_rule(cancel, "mangle", &[MARK_CHAIN, "-d", net, "-j", "RETURN"])
                .await?;
        }

        self.ipt
            .append_rule(
                cancel,
                "mangle",
                &[
                    MARK_CHAIN,
                    "-m",
                    "set",
                    "--match-set",
                    &self.set_name,
                    "dst",
                    "-j",
                    "MARK",
                    "--set-mark",
                    FWMARK,
                ],
            )
            .await?;

        if self.ingress_iface.is_empty() {
            self.ipt
                .append_rule(cancel, "mangle", &["PREROUTING", "-j", MARK_CHAIN])
                .await?;
        } else {
            self.ipt
                .append_rule(
                    cancel,
                    "mangle",
                    &["PREROUTING", "-i", &self.ingress_iface, "-j", MARK_CHAIN],
                )
                .await?;
        }

        if let Err(e) = run_silent(
            cancel,
            "ip",
            &["rule", "add", "fwmark", FWMARK, "table", ROUTE_TABLE],
        )
        .await
        {
            // Usually means the rule already exists.
            warn!(error = %e, "fwmark rule add failed");
        }

        run_silent(
            cancel,
            "ip",
            &[
                "route",
                "replace",
                "default",
                "dev",
                &self.vpn_iface,
                "table",
                ROUTE_TABLE,
            ],
        )
        .await?;

        Ok(())
    }

    async fn teardown_rules(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        info!("tearing down mark rules");

        self.ipt
            .remove_jump_rules(cancel, "mangle", "PREROUTING", MARK_CHAIN)
            .await
            .ok();
        self.ipt.delete_chain(cancel, "mangle", MARK_CHAIN).await.ok();

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
            &["route", "del", "default", "table", ROUTE_TABLE],
        )
        .await
        .ok();

        Ok(())
    }

    async fn is_active(&self, _cancel: &CancellationToken) -> bool {
        // The tunnel is usable when its interface exists and is up.
        let operstate = format!("/sys/class/net/{}/operstate", self.vpn_iface);
        match tokio::fs::read_to_string(operstate).await {
            Ok(state) => matches!(state.trim(), "up" | "unknown"),
            Err(_) => false,
        }
    }
}
