//! Kernel address-set driver
//!
//! Wraps the `ipset` utility for a single named `hash:net` set of one
//! address family. Operations are idempotent: `add`/`del` pass `-exist`,
//! `ensure_table` is a no-op when the set already exists. Callers reconcile
//! toward a target state by issuing sequences of these operations; nothing
//! here is transactional.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::NetfilterResult;
use super::exec::{run, run_silent};

/// Address family of a kernel set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFamily {
    /// `family inet`
    V4,
    /// `family inet6`
    V6,
}

impl SetFamily {
    const fn as_arg(self) -> &'static str {
        match self {
            Self::V4 => "inet",
            Self::V6 => "inet6",
        }
    }
}

/// Capability over one named kernel address set.
///
/// `IpSet` is the production implementation; tests substitute an in-memory
/// recording implementation. All methods are safe to call concurrently.
#[async_trait]
pub trait AddrSet: Send + Sync {
    /// The kernel set name
    fn name(&self) -> &str;

    /// Create the set if it does not exist. Idempotent.
    async fn ensure_table(&self, cancel: &CancellationToken) -> NetfilterResult<()>;

    /// Add an IP or CIDR member. Tolerates an existing identical entry.
    async fn add(&self, cancel: &CancellationToken, entry: &str) -> NetfilterResult<()>;

    /// Remove a member. Tolerates a missing entry.
    async fn del(&self, cancel: &CancellationToken, entry: &str) -> NetfilterResult<()>;

    /// Remove all members.
    async fn flush(&self, cancel: &CancellationToken) -> NetfilterResult<()>;

    /// Enumerate current members (addresses only, metadata stripped).
    async fn list(&self, cancel: &CancellationToken) -> NetfilterResult<Vec<String>>;

    /// Number of current members.
    async fn count(&self, cancel: &CancellationToken) -> NetfilterResult<usize>;

    /// Remove the set entirely.
    async fn destroy(&self, cancel: &CancellationToken) -> NetfilterResult<()>;
}

/// `ipset`-backed address set
#[derive(Debug, Clone)]
pub struct IpSet {
    name: String,
    family: SetFamily,
}

impl IpSet {
    /// Create a driver for an IPv4 `hash:net` set
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: SetFamily::V4,
        }
    }

    /// Create a driver for an IPv6 `hash:net` set
    #[must_use]
    pub fn new_v6(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: SetFamily::V6,
        }
    }

    /// The set's address family
    #[must_use]
    pub const fn family(&self) -> SetFamily {
        self.family
    }
}

#[async_trait]
impl AddrSet for IpSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_table(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        // Listing succeeds iff the set exists.
        if run(cancel, "ipset", &["list", &self.name, "-name"]).await.is_ok() {
            return Ok(());
        }
        run_silent(
            cancel,
            "ipset",
            &[
                "create",
                &self.name,
                "hash:net",
                "family",
                self.family.as_arg(),
                "-exist",
            ],
        )
        .await
    }

    async fn add(&self, cancel: &CancellationToken, entry: &str) -> NetfilterResult<()> {
        run_silent(cancel, "ipset", &["add", &self.name, entry, "-exist"]).await
    }

    async fn del(&self, cancel: &CancellationToken, entry: &str) -> NetfilterResult<()> {
        run_silent(cancel, "ipset", &["del", &self.name, entry, "-exist"]).await
    }

    async fn flush(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        run_silent(cancel, "ipset", &["flush", &self.name]).await
    }

    async fn list(&self, cancel: &CancellationToken) -> NetfilterResult<Vec<String>> {
        let out = run(cancel, "ipset", &["list", &self.name]).await?;
        Ok(parse_members(&out))
    }

    async fn count(&self, cancel: &CancellationToken) -> NetfilterResult<usize> {
        Ok(self.list(cancel).await?.len())
    }

    async fn destroy(&self, cancel: &CancellationToken) -> NetfilterResult<()> {
        run_silent(cancel, "ipset", &["destroy", &self.name]).await
    }
}

/// Extract member addresses from `ipset list` output.
///
/// Members follow the `Members:` header, one per line. A member line may
/// carry trailing metadata tokens (e.g. `timeout 3600`); only the first
/// whitespace-delimited token is the address.
fn parse_members(output: &str) -> Vec<String> {
    let mut members = Vec::new();
    let mut in_members = false;
    for line in output.lines() {
        let line = line.trim();
        if line == "Members:" {
            in_members = true;
            continue;
        }
        if in_members {
            if let Some(addr) = line.split_whitespace().next() {
                members.push(addr.to_string());
            }
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_members_basic() {
        let output = "\
Name: bypass
Type: hash:net
Revision: 7
Header: family inet hashsize 1024 maxelem 65536
Size in memory: 504
References: 1
Number of entries: 3
Members:
93.184.216.34
10.20.0.0/16
198.51.100.7";
        let members = parse_members(output);
        assert_eq!(members, vec!["93.184.216.34", "10.20.0.0/16", "198.51.100.7"]);
    }

    #[test]
    fn test_parse_members_with_metadata() {
        let output = "\
Name: bypass
Members:
93.184.216.34 timeout 86313
203.0.113.7 timeout 0 comment \"pinned\"";
        let members = parse_members(output);
        assert_eq!(members, vec!["93.184.216.34", "203.0.113.7"]);
    }

    #[test]
    fn test_parse_members_empty() {
        let output = "Name: bypass\nMembers:";
        assert!(parse_members(output).is_empty());

        // No Members section at all
        assert!(parse_members("Name: bypass").is_empty());
    }

    #[test]
    fn test_family_args() {
        assert_eq!(SetFamily::V4.as_arg(), "inet");
        assert_eq!(SetFamily::V6.as_arg(), "inet6");
    }

    #[test]
    fn test_constructors() {
        let v4 = IpSet::new("bypass");
        assert_eq!(v4.name(), "bypass");
        assert_eq!(v4.family(), SetFamily::V4);

        let v6 = IpSet::new_v6("bypass6");
        assert_eq!(v6.name(), "bypass6");
        assert_eq!(v6.family(), SetFamily::V6);
    }
}
