//! IPVS backend.
//!
//! Each external endpoint becomes a round-robin virtual service with the
//! fixed endpoints as masqueraded real servers. Commands run one at a time;
//! a failing command is logged, counted in the report and skipped.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddrV4;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ApplyReport, NatRule, RawDirective, RuleBatch, RuleManager, RuleOp};
use crate::error::Result;
use crate::exec::CommandExecutor;

const IPVSADM: &str = "ipvsadm";
const SCHEDULER: &str = "rr";

pub struct VirtualServerBackend {
    executor: Arc<dyn CommandExecutor>,
    batch: RuleBatch,
    /// Virtual services this backend created, with their real servers.
    services: HashMap<SocketAddrV4, BTreeSet<SocketAddrV4>>,
}

impl VirtualServerBackend {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            batch: RuleBatch::default(),
            services: HashMap::new(),
        }
    }

    /// Real servers currently registered behind `external`.
    pub fn real_servers(&self, external: &SocketAddrV4) -> Option<&BTreeSet<SocketAddrV4>> {
        self.services.get(external)
    }

    /// Run one `ipvsadm` invocation, returning whether it succeeded.
    async fn ipvsadm(&self, args: &[String], report: &mut ApplyReport) -> bool {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(IPVSADM.to_string());
        cmd.extend_from_slice(args);
        match self.executor.check(&cmd, None).await {
            Ok(_) => {
                report.executed += 1;
                true
            }
            Err(e) => {
                warn!(cmd = %cmd.join(" "), error = %e, "ipvsadm command failed, skipping");
                report.failed += 1;
                false
            }
        }
    }

    async fn add(&mut self, rule: &NatRule, report: &mut ApplyReport) {
        let ext = rule.external.to_string();
        if !self.services.contains_key(&rule.external) {
            let created = self
                .ipvsadm(&args(&["-A", "-t", &ext, "-s", SCHEDULER]), report)
                .await;
            if !created {
                return;
            }
            self.services.insert(rule.external, BTreeSet::new());
        }
        if self
            .services
            .get(&rule.external)
            .is_some_and(|reals| reals.contains(&rule.fixed))
        {
            debug!(%rule, "Real server already registered");
            return;
        }
        let fixed = rule.fixed.to_string();
        if self
            .ipvsadm(&args(&["-a", "-t", &ext, "-r", &fixed, "-m"]), report)
            .await
        {
            if let Some(reals) = self.services.get_mut(&rule.external) {
                reals.insert(rule.fixed);
            }
        }
    }

    async fn remove(&mut self, rule: &NatRule, report: &mut ApplyReport) {
        let Some(reals) = self.services.get(&rule.external) else {
            debug!(%rule, "No virtual service to remove");
            return;
        };
        let ext = rule.external.to_string();
        if reals.contains(&rule.fixed) {
            let fixed = rule.fixed.to_string();
            if !self
                .ipvsadm(&args(&["-d", "-t", &ext, "-r", &fixed]), report)
                .await
            {
                return;
            }
            if let Some(reals) = self.services.get_mut(&rule.external) {
                reals.remove(&rule.fixed);
            }
        }
        let empty = self
            .services
            .get(&rule.external)
            .is_some_and(BTreeSet::is_empty);
        if empty && self.ipvsadm(&args(&["-D", "-t", &ext]), report).await {
            self.services.remove(&rule.external);
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

#[async_trait]
impl RuleManager for VirtualServerBackend {
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
        let mut report = ApplyReport::default();
        for op in self.batch.take() {
            match op {
                RuleOp::Clear => {
                    if self.ipvsadm(&args(&["-C"]), &mut report).await {
                        self.services.clear();
                    }
                }
                RuleOp::Add(rule) => self.add(&rule, &mut report).await,
                RuleOp::Remove(rule) => self.remove(&rule, &mut report).await,
                RuleOp::Raw(RawDirective::Ipvs { ipvs }) => {
                    let parts: Vec<String> = ipvs.split_whitespace().map(String::from).collect();
                    if parts.is_empty() {
                        warn!("Ignoring empty ipvsadm directive");
                        continue;
                    }
                    self.ipvsadm(&parts, &mut report).await;
                }
                RuleOp::Raw(other) => warn!(directive = %other, "Ignoring non-ipvs directive"),
            }
        }
        if report.executed + report.failed > 0 {
            info!(
                executed = report.executed,
                failed = report.failed,
                "Applied ipvs rules"
            );
        }
        Ok(report)
    }
}
