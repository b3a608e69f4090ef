//! Kernel packet-filter driver
//!
//! Wraps `iptables` / `ip6tables`, selected by family at construction.
//! Every invocation passes `-w` to wait for the xtables lock. Mutating
//! operations are check-before-mutate so that each call is idempotent.

use tokio_util::sync::CancellationToken;

use super::error::NetfilterResult;
use super::exec::run;

/// Packet-filter address family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// The utility binary for this family
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }
}

/// Driver over `iptables` or `ip6tables`
#[derive(Debug, Clone, Copy)]
pub struct RuleDriver {
    family: Family,
}

impl RuleDriver {
    /// Create an IPv4 driver
    #[must_use]
    pub const fn new() -> Self {
        Self { family: Family::V4 }
    }

    /// Create an IPv6 driver
    #[must_use]
    pub const fn new_v6() -> Self {
        Self { family: Family::V6 }
    }

    /// The driver's address family
    #[must_use]
    pub const fn family(&self) -> Family {
        self.family
    }

    async fn invoke(&self, cancel: &CancellationToken, args: &[&str]) -> NetfilterResult<String> {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        full.push("-w");
        full.extend_from_slice(args);
        run(cancel, self.family.command(), &full).await
    }

    async fn invoke_silent(&self, cancel: &CancellationToken, args: &[&str]) -> NetfilterResult<()> {
        self.invoke(cancel, args).await.map(|_| ())
    }

    /// Check whether a chain exists in the given table (by listing it).
    pub async fn chain_exists(&self, cancel: &CancellationToken, table: &str, chain: &str) -> bool {
        self.invoke_silent(cancel, &["-t", table, "-L", chain, "-n"])
            .await
            .is_ok()
    }

    /// Create a chain if it does not exist. Idempotent.
    pub async fn create_chain(
        &self,
        cancel: &CancellationToken,
        table: &str,
        chain: &str,
    ) -> NetfilterResult<()> {
        if self.chain_exists(cancel, table, chain).await {
            return Ok(());
        }
        self.invoke_silent(cancel, &["-t", table, "-N", chain]).await
    }

    /// Flush then drop a chain. Idempotent; a missing chain is a no-op.
    pub async fn delete_chain(
        &self,
        cancel: &CancellationToken,
        table: &str,
        chain: &str,
    ) -> NetfilterResult<()> {
        if !self.chain_exists(cancel, table, chain).await {
            return Ok(());
        }
        let _ = self.invoke_silent(cancel, &["-t", table, "-F", chain]).await;
        self.invoke_silent(cancel, &["-t", table, "-X", chain]).await
    }

    /// Check whether a specific rule exists (`-C`).
    pub async fn rule_exists(
        &self,
        cancel: &CancellationToken,
        table: &str,
        rule_spec: &[&str],
    ) -> bool {
        let mut args: Vec<&str> = vec!["-t", table, "-C"];
        args.extend_from_slice(rule_spec);
        self.invoke_silent(cancel, &args).await.is_ok()
    }

    /// Append a rule if it does not already exist.
    pub async fn append_rule(
        &self,
        cancel: &CancellationToken,
        table: &str,
        rule_spec: &[&str],
    ) -> NetfilterResult<()> {
        if self.rule_exists(cancel, table, rule_spec).await {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["-t", table, "-A"];
        args.extend_from_slice(rule_spec);
        self.invoke_silent(cancel, &args).await
    }

    /// Insert a rule at position 1 if it does not already exist.
    pub async fn insert_rule(
        &self,
        cancel: &CancellationToken,
        table: &str,
        rule_spec: &[&str],
    ) -> NetfilterResult<()> {
        if self.rule_exists(cancel, table, rule_spec).await {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["-t", table, "-I"];
        args.extend_from_slice(rule_spec);
        self.invoke_silent(cancel, &args).await
    }

    /// Delete a rule if it exists.
    pub async fn delete_rule(
        &self,
        cancel: &CancellationToken,
        table: &str,
        rule_spec: &[&str],
    ) -> NetfilterResult<()> {
        if !self.rule_exists(cancel, table, rule_spec).await {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["-t", table, "-D"];
        args.extend_from_slice(rule_spec);
        self.invoke_silent(cancel, &args).await
    }

    /// Remove every jump to `target` from `parent`.
    ///
    /// Lists the parent chain with line numbers and deletes matching lines
    /// from highest to lowest so earlier deletions do not shift later
    /// indices. A missing parent chain is not an error.
    pub async fn remove_jump_rules(
        &self,
        cancel: &CancellationToken,
        table: &str,
        parent: &str,
        target: &str,
    ) -> NetfilterResult<()> {
        let out = match self
            .invoke(cancel, &["-t", table, "-L", parent, "--line-numbers", "-n"])
            .await
        {
            Ok(out) => out,
            Err(_) => return Ok(()),
        };

        for num in jump_rule_lines(&out, target) {
            let num = num.to_string();
            self.invoke_silent(cancel, &["-t", table, "-D", parent, &num])
                .await?;
        }
        Ok(())
    }
}

impl Default for RuleDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect line numbers of rules targeting `target`, highest first.
fn jump_rule_lines(listing: &str, target: &str) -> Vec<u32> {
    let mut nums: Vec<u32> = Vec::new();
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let (Some(num), Some(tgt)) = (fields.next(), fields.next()) else {
            continue;
        };
        if tgt == target {
            if let Ok(n) = num.parse::<u32>() {
                nums.push(n);
            }
        }
    }
    nums.sort_unstable_by(|a, b| b.cmp(a));
    nums
}
