//! Agent configuration.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::error::{NatError, Result};
use crate::gateway::InterfaceDriverKind;
use crate::rules::{RawDirective, RuleBackend};

/// Runtime settings of a [`crate::agent::NatAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host: String,
    pub interface_driver: InterfaceDriverKind,
    pub rule_backend: RuleBackend,
    /// External address vservers are allocated on.
    pub local_external_ip: Ipv4Addr,
    /// Gateway for bindings without a port.
    pub local_internal_ip: Ipv4Addr,
    pub external_port_start: u16,
    pub console_enabled: bool,
    pub console_port: u16,
    /// Staged after every full rebuild, already checked against `rule_backend`.
    pub user_rules: Vec<RawDirective>,
    pub resync_interval: Duration,
    /// Zero disables state reports.
    pub report_interval: Duration,
}

impl AgentConfig {
    pub fn new(host: &str, interface_driver: InterfaceDriverKind, rule_backend: RuleBackend) -> Self {
        Self {
            host: host.to_string(),
            interface_driver,
            rule_backend,
            local_external_ip: Ipv4Addr::LOCALHOST,
            local_internal_ip: Ipv4Addr::LOCALHOST,
            external_port_start: 10000,
            console_enabled: false,
            console_port: 6080,
            user_rules: Vec::new(),
            resync_interval: Duration::from_secs(3),
            report_interval: Duration::from_secs(30),
        }
    }
}

/// Load raw directives from a JSON array file.
///
/// Every directive must target `backend`; a mismatch is a configuration error.
pub fn load_user_rules(path: &Path, backend: RuleBackend) -> Result<Vec<RawDirective>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| NatError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let rules: Vec<RawDirective> = serde_json::from_str(&content)
        .map_err(|e| NatError::Config(format!("invalid user rules in {}: {}", path.display(), e)))?;
    if let Some(bad) = rules.iter().find(|r| !r.matches(backend)) {
        return Err(NatError::Config(format!(
            "user rule `{}` does not apply to the {} backend",
            bad,
            backend.as_str()
        )));
    }
    Ok(rules)
}
