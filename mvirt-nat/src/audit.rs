//! NAT-specific audit logging
//!
//! Audit events are emitted as `tracing` events on the `audit` target so the
//! subscriber (or a log shipper) can route them apart from diagnostics.

use tracing::{debug, info, warn};

const AUDIT_COMPONENT: &str = "nat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditLevel {
    Audit,
    Warn,
    Debug,
}

/// NAT audit logger with domain-specific methods.
#[derive(Debug, Default, Clone)]
pub struct NatAuditLogger {
    host: String,
}

impl NatAuditLogger {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
        }
    }

    fn log(&self, level: AuditLevel, message: String, object_ids: Vec<String>) {
        match level {
            AuditLevel::Audit => info!(
                target: "audit",
                component = AUDIT_COMPONENT,
                host = %self.host,
                objects = ?object_ids,
                "{}",
                message
            ),
            AuditLevel::Warn => warn!(
                target: "audit",
                component = AUDIT_COMPONENT,
                host = %self.host,
                objects = ?object_ids,
                "{}",
                message
            ),
            AuditLevel::Debug => debug!(
                target: "audit",
                component = AUDIT_COMPONENT,
                host = %self.host,
                objects = ?object_ids,
                "{}",
                message
            ),
        }
    }

    // === Binding Events ===

    pub fn binding_applied(&self, binding_id: &str, rule: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Binding applied: {}", rule),
            vec![binding_id.to_string()],
        );
    }

    pub fn binding_removed(&self, binding_id: &str, rule: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Binding removed: {}", rule),
            vec![binding_id.to_string()],
        );
    }

    pub fn stale_binding_deleted(&self, binding_id: &str) {
        self.log(
            AuditLevel::Warn,
            "Stale binding deleted".to_string(),
            vec![binding_id.to_string()],
        );
    }

    pub fn vserver_assigned(&self, binding_id: &str, vserver_id: &str, endpoint: &str) {
        self.log(
            AuditLevel::Audit,
            format!("VServer {} assigned", endpoint),
            vec![binding_id.to_string(), vserver_id.to_string()],
        );
    }

    // === Gateway Events ===

    pub fn gateway_plugged(&self, port_id: &str, device: &str, cidr: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Gateway {} plugged with {}", device, cidr),
            vec![port_id.to_string()],
        );
    }

    pub fn gateway_unplugged(&self, port_id: &str, device: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Gateway {} unplugged", device),
            vec![port_id.to_string()],
        );
    }

    // === Agent Events ===

    pub fn console_binding_requested(&self, host_name: &str, fixed_ip: &str) {
        self.log(
            AuditLevel::Audit,
            format!("Console binding requested for {} ({})", host_name, fixed_ip),
            vec![host_name.to_string()],
        );
    }

    pub fn full_rebuild(&self, rules: usize) {
        self.log(
            AuditLevel::Debug,
            format!("Rebuilt rule set with {} rules", rules),
            vec![],
        );
    }
}
