//! iptables backend.
//!
//! Rules live in agent-owned chains of the `nat` table (`mvirt-nat-PREROUTING`,
//! ...), each reached by a jump from its builtin chain. The backend keeps the
//! committed rule set in memory and rewrites all owned chains with a single
//! `iptables-restore --noflush` call, so an apply either lands completely or
//! not at all.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ApplyReport, NatRule, RawDirective, RuleBatch, RuleManager, RuleOp};
use crate::error::Result;
use crate::exec::{argv, CommandExecutor};

const TABLE: &str = "nat";
const WRAP_PREFIX: &str = "mvirt-nat";

/// Builtin chains of the nat table the agent hooks into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Chain {
    Prerouting,
    Output,
    Postrouting,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Prerouting, Chain::Output, Chain::Postrouting];

    pub fn builtin(&self) -> &'static str {
        match self {
            Chain::Prerouting => "PREROUTING",
            Chain::Output => "OUTPUT",
            Chain::Postrouting => "POSTROUTING",
        }
    }

    /// Name of the agent-owned chain.
    pub fn wrapped(&self) -> String {
        format!("{}-{}", WRAP_PREFIX, self.builtin())
    }

    pub fn parse(name: &str) -> Option<Chain> {
        Chain::ALL
            .into_iter()
            .find(|c| c.builtin().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRule {
    pub chain: Chain,
    pub rule: String,
}

/// The DNAT rule toward the fixed endpoint and the SNAT rule that makes
/// return traffic come back through the gateway.
pub fn nat_rules(rule: &NatRule) -> [ChainRule; 2] {
    [
        ChainRule {
            chain: Chain::Prerouting,
            rule: format!(
                "-d {} -p tcp -m tcp --dport {} -j DNAT --to-destination {}",
                rule.external.ip(),
                rule.external.port(),
                rule.fixed
            ),
        },
        ChainRule {
            chain: Chain::Postrouting,
            rule: format!(
                "-d {} -p tcp -m tcp --dport {} -j SNAT --to-source {}",
                rule.fixed.ip(),
                rule.fixed.port(),
                rule.gateway
            ),
        },
    ]
}

/// Render an `iptables-restore` document that replaces every owned chain.
pub fn render(rules: &[ChainRule]) -> String {
    let mut doc = format!("*{TABLE}\n");
    for chain in Chain::ALL {
        let _ = writeln!(doc, ":{} - [0:0]", chain.wrapped());
    }
    let mut seen: Vec<&ChainRule> = Vec::with_capacity(rules.len());
    for r in rules {
        if seen.contains(&r) {
            continue;
        }
        seen.push(r);
        let _ = writeln!(doc, "-A {} {}", r.chain.wrapped(), r.rule);
    }
    doc.push_str("COMMIT\n");
    doc
}

pub struct PacketFilterBackend {
    executor: Arc<dyn CommandExecutor>,
    batch: RuleBatch,
    /// Rules currently in the kernel. May hold duplicates: two bindings can
    /// share a SNAT rule and removing one must keep the other.
    rules: Vec<ChainRule>,
    jumps_ready: bool,
}

impl PacketFilterBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            batch: RuleBatch::default(),
            rules: Vec::new(),
            jumps_ready: false,
        }
    }

    /// The committed rule set.
    pub fn rules(&self) -> &[ChainRule] {
        &self.rules
    }

    fn staged(&self, ops: Vec<RuleOp>) -> Vec<ChainRule> {
        let mut rules = self.rules.clone();
        for op in ops {
            match op {
                RuleOp::Clear => rules.clear(),
                RuleOp::Add(rule) => rules.extend(nat_rules(&rule)),
                RuleOp::Remove(rule) => {
                    for r in nat_rules(&rule) {
                        if let Some(pos) = rules.iter().position(|x| *x == r) {
                            rules.remove(pos);
                        }
                    }
                }
                RuleOp::Raw(RawDirective::Chain { chain, rule }) => match Chain::parse(&chain) {
                    Some(chain) => rules.push(ChainRule { chain, rule }),
                    None => warn!(%chain, %rule, "Ignoring rule for unknown nat chain"),
                },
                RuleOp::Raw(other) => warn!(directive = %other, "Ignoring non-iptables directive"),
            }
        }
        rules
    }

    /// Make sure each builtin chain jumps into its owned chain.
    async fn ensure_jumps(&mut self) -> Result<()> {
        if self.jumps_ready {
            return Ok(());
        }
        for chain in Chain::ALL {
            let wrapped = chain.wrapped();
            let exists = self
                .executor
                .run(
                    &argv(&["iptables", "-t", TABLE, "-C", chain.builtin(), "-j", &wrapped]),
                    None,
                )
                .await?
                .success();
            if !exists {
                self.executor
                    .check(
                        &argv(&["iptables", "-t", TABLE, "-I", chain.builtin(), "-j", &wrapped]),
                        None,
                    )
                    .await?;
                debug!(chain = chain.builtin(), %wrapped, "Installed jump rule");
            }
        }
        self.jumps_ready = true;
        Ok(())
    }
}

#[async_trait]
impl RuleManager for PacketFilterBackend {
    fn clear(&mut self) {
        self.batch.push(RuleOp::Clear);
    }

    fn add_rule(&mut self, rule: &NatRule) {
        self.batch.push(RuleOp::Add(*rule));
    }

    fn remove_rule(&mut self, rule: &NatRule) {
        self.batch.push(RuleOp::Remove(*rule));
    }

    fn add_raw(&mut self, directive: RawDirective) {
        self.batch.push(RuleOp::Raw(directive));
    }

    async fn apply(&mut self) -> Result<ApplyReport> {
        if self.batch.is_empty() {
            return Ok(ApplyReport::default());
        }
        let ops = self.batch.take();
        let candidate = self.staged(ops);
        if candidate == self.rules && self.jumps_ready {
            debug!("iptables rule set unchanged, nothing to apply");
            return Ok(ApplyReport::default());
        }

        let doc = render(&candidate);
        self.executor
            .check(&argv(&["iptables-restore", "--noflush"]), Some(&doc))
            .await?;
        self.rules = candidate;
        self.ensure_jumps().await?;

        info!(rules = self.rules.len(), "Applied iptables nat rules");
        Ok(ApplyReport {
            executed: 1,
            failed: 0,
        })
    }
}
