//! NAT rule managers.
//!
//! A [`RuleManager`] stages rule operations in a [`RuleBatch`] and only
//! touches the kernel in [`RuleManager::apply`]. The two backends differ in
//! failure semantics:
//!
//! - [`PacketFilterBackend`]: the whole rule set is restored in one atomic
//!   call. An error means nothing was applied and the batch can be retried.
//! - [`VirtualServerBackend`]: commands run one by one; a failing command is
//!   logged and skipped. A report with failures means the kernel may hold
//!   any subset of the batch, so callers must re-derive state instead of
//!   assuming a rollback.

pub mod packet_filter;
pub mod virtual_server;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::exec::CommandExecutor;

pub use packet_filter::PacketFilterBackend;
pub use virtual_server::VirtualServerBackend;

/// A DNAT/SNAT pair forwarding `external` to `fixed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NatRule {
    pub external: SocketAddrV4,
    pub fixed: SocketAddrV4,
    /// Source address for traffic toward `fixed`. Unused by IPVS.
    pub gateway: Ipv4Addr,
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} via {}", self.external, self.fixed, self.gateway)
    }
}

/// A backend-specific directive passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDirective {
    /// An iptables rule body for a chain of the `nat` table.
    Chain { chain: String, rule: String },
    /// An `ipvsadm` argument string.
    Ipvs { ipvs: String },
}

impl RawDirective {
    pub fn matches(&self, backend: RuleBackend) -> bool {
        matches!(
            (self, backend),
            (RawDirective::Chain { .. }, RuleBackend::Iptables)
                | (RawDirective::Ipvs { .. }, RuleBackend::Ipvs)
        )
    }
}

impl fmt::Display for RawDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawDirective::Chain { chain, rule } => write!(f, "{chain}: {rule}"),
            RawDirective::Ipvs { ipvs } => write!(f, "ipvsadm {ipvs}"),
        }
    }
}

/// A staged rule operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOp {
    Clear,
    Add(NatRule),
    Remove(NatRule),
    Raw(RawDirective),
}

/// Append-only buffer of pending operations, drained by `apply()`.
#[derive(Debug, Default)]
pub struct RuleBatch {
    ops: Vec<RuleOp>,
}

impl RuleBatch {
    pub fn push(&mut self, op: RuleOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Take every pending operation, leaving the batch empty.
    pub fn take(&mut self) -> Vec<RuleOp> {
        std::mem::take(&mut self.ops)
    }
}

/// Outcome of an `apply()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Kernel-facing commands that succeeded.
    pub executed: usize,
    /// Kernel-facing commands that failed and were skipped.
    pub failed: usize,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Which rule backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuleBackend {
    /// iptables DNAT/SNAT rules in the nat table.
    Iptables,
    /// IPVS virtual services in masquerading mode.
    Ipvs,
}

impl RuleBackend {
    /// IPVS masquerading needs the agent to be the backend's default route,
    /// so gateway ports take the subnet gateway address.
    pub fn uses_subnet_gateway(&self) -> bool {
        matches!(self, RuleBackend::Ipvs)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleBackend::Iptables => "iptables",
            RuleBackend::Ipvs => "ipvs",
        }
    }
}

#[async_trait]
pub trait RuleManager: Send + Sync {
    /// Stage removal of every rule this manager owns.
    fn clear(&mut self);

    fn add_rule(&mut self, rule: &NatRule);

    fn remove_rule(&mut self, rule: &NatRule);

    fn add_raw(&mut self, directive: RawDirective);

    /// Push the staged batch to the kernel. The batch is empty afterwards,
    /// whatever the outcome.
    async fn apply(&mut self) -> Result<ApplyReport>;
}

/// Construct the configured backend.
pub fn build(backend: RuleBackend, executor: Arc<dyn CommandExecutor>) -> Box<dyn RuleManager> {
    match backend {
        RuleBackend::Iptables => Box::new(PacketFilterBackend::new(executor)),
        RuleBackend::Ipvs => Box::new(VirtualServerBackend::new(executor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_directive_json() {
        let raw: Vec<RawDirective> = serde_json::from_str(
            r#"[
                {"chain": "PREROUTING", "rule": "-p udp --dport 53 -j DNAT --to-destination 10.0.0.53"},
                {"ipvs": "-A -t 192.0.2.1:80 -s rr"}
            ]"#,
        )
        .unwrap();

        assert!(raw[0].matches(RuleBackend::Iptables));
        assert!(!raw[0].matches(RuleBackend::Ipvs));
        assert_eq!(
            raw[1],
            RawDirective::Ipvs {
                ipvs: "-A -t 192.0.2.1:80 -s rr".into()
            }
        );
        assert!(raw[1].matches(RuleBackend::Ipvs));
    }

    #[test]
    fn test_batch_take_empties() {
        let mut batch = RuleBatch::default();
        batch.push(RuleOp::Clear);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.take(), vec![RuleOp::Clear]);
        assert!(batch.is_empty());
    }
}
