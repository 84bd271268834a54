//! Typed vnat resources exchanged with the control plane.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use tracing::warn;

use crate::error::{NatError, Result};
use crate::rules::NatRule;

/// What a binding forwards to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// A port on a tenant instance.
    Instance,
    /// A compute host (console access).
    Hypervisor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingStatus {
    Active,
    Inactive,
}

/// A vnat: forwards an external endpoint to a fixed (backend) endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: String,
    pub kind: BindingKind,
    pub device_id: Option<String>,
    pub external_ip: Option<Ipv4Addr>,
    pub external_port: Option<u16>,
    pub fixed_ip: Option<Ipv4Addr>,
    pub fixed_port: Option<u16>,
    /// Internal next hop used as SNAT source for return traffic.
    pub gateway: Option<Ipv4Addr>,
    pub vserver_id: Option<String>,
    pub status: BindingStatus,
    pub admin_state_up: bool,
    pub shared: bool,
    pub tenant_id: Option<String>,
    pub port_id: Option<String>,
}

impl Binding {
    pub fn new(id: impl Into<String>, kind: BindingKind) -> Self {
        Self {
            id: id.into(),
            kind,
            device_id: None,
            external_ip: None,
            external_port: None,
            fixed_ip: None,
            fixed_port: None,
            gateway: None,
            vserver_id: None,
            status: BindingStatus::Inactive,
            admin_state_up: true,
            shared: false,
            tenant_id: None,
            port_id: None,
        }
    }

    pub fn external_endpoint(&self) -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(self.external_ip?, self.external_port?))
    }

    pub fn fixed_endpoint(&self) -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(self.fixed_ip?, self.fixed_port?))
    }

    /// ACTIVE with a vserver and external endpoint recorded.
    pub fn is_assigned(&self) -> bool {
        self.status == BindingStatus::Active
            && self.vserver_id.is_some()
            && self.external_endpoint().is_some()
    }

    /// The rule pair this binding needs in the kernel, if any.
    ///
    /// Only ACTIVE bindings with both endpoints known are forwarded.
    /// `default_gateway` stands in for bindings that never got a gateway recorded.
    pub fn nat_rule(&self, default_gateway: Ipv4Addr) -> Option<NatRule> {
        if self.status != BindingStatus::Active {
            return None;
        }
        self.recorded_rule(default_gateway)
    }

    /// The rule pair described by the recorded endpoints, regardless of status.
    pub fn recorded_rule(&self, default_gateway: Ipv4Addr) -> Option<NatRule> {
        Some(NatRule {
            external: self.external_endpoint()?,
            fixed: self.fixed_endpoint()?,
            gateway: self.gateway.unwrap_or(default_gateway),
        })
    }
}

/// Fields the agent writes back onto a binding. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingUpdate {
    pub external_ip: Option<Ipv4Addr>,
    pub external_port: Option<u16>,
    pub vserver_id: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub device_id: Option<String>,
    pub status: Option<BindingStatus>,
    pub admin_state_up: Option<bool>,
}

impl BindingUpdate {
    /// Overwrite the fields of `binding` this update sets.
    pub fn apply_to(&self, binding: &mut Binding) {
        if let Some(ip) = self.external_ip {
            binding.external_ip = Some(ip);
        }
        if let Some(port) = self.external_port {
            binding.external_port = Some(port);
        }
        if let Some(id) = &self.vserver_id {
            binding.vserver_id = Some(id.clone());
        }
        if let Some(gw) = self.gateway {
            binding.gateway = Some(gw);
        }
        if let Some(device) = &self.device_id {
            binding.device_id = Some(device.clone());
        }
        if let Some(status) = self.status {
            binding.status = status;
        }
        if let Some(up) = self.admin_state_up {
            binding.admin_state_up = up;
        }
    }
}

/// Request to create a binding on the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBinding {
    pub fixed_ip: Ipv4Addr,
    pub kind: BindingKind,
    pub fixed_port: Option<u16>,
    pub device_id: Option<String>,
    pub port_id: Option<String>,
    pub tenant_id: Option<String>,
    pub shared: bool,
}

/// An external endpoint shared by one or more bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VServer {
    pub id: String,
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceStatus {
    Down,
    Active,
}

/// A port the control plane allocated for this agent's gateway on a subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInterface {
    pub port_id: String,
    pub network_id: String,
    pub subnet_id: String,
    pub mac_address: String,
    pub fixed_ips: Vec<Ipv4Addr>,
    pub status: InterfaceStatus,
}

impl GatewayInterface {
    /// First fixed address of the port.
    pub fn address(&self) -> Result<Ipv4Addr> {
        let first = self
            .fixed_ips
            .first()
            .copied()
            .ok_or_else(|| NatError::NoGatewayAddress(self.port_id.clone()))?;
        if self.fixed_ips.len() > 1 {
            warn!(port_id = %self.port_id, "Ignoring multiple IPs on gateway port");
        }
        Ok(first)
    }

    /// Port address with the subnet's prefix length, e.g. `10.0.0.2/24`.
    pub fn ip_cidr(&self, subnet: &Subnet) -> Result<Ipv4Net> {
        let addr = self.address()?;
        Ipv4Net::new(addr, subnet.cidr.prefix_len())
            .map_err(|e| NatError::invalid("subnet", e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: Ipv4Net,
    pub gateway_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeHost {
    pub host_name: String,
    pub service: String,
}

/// Notification pushed by the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum NatEvent {
    BindingCreated(Binding),
    BindingDeleted(Binding),
    AgentUpdated { admin_state_up: bool },
}

/// Periodic liveness report of this agent.
#[derive(Debug, Clone)]
pub struct AgentStateReport {
    pub host: String,
    pub agent_id: String,
    pub binary: String,
    pub start_flag: bool,
    pub configurations: BTreeMap<String, String>,
    pub bindings: usize,
    pub reported_at: DateTime<Utc>,
}
