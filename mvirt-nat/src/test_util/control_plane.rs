//! In-memory control plane.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::lock;
use crate::clients::{BindingScope, ComputeInventory, ControlPlane, EventStream};
use crate::error::{NatError, Result};
use crate::model::{
    AgentStateReport, Binding, BindingUpdate, ComputeHost, GatewayInterface, InterfaceStatus,
    NatEvent, NewBinding, Subnet, VServer,
};
use crate::vserver::VServerStore;

#[derive(Debug, Default)]
struct State {
    /// Bindings in storage order, with whether they are scheduled to this agent.
    bindings: Vec<(Binding, bool)>,
    created: Vec<NewBinding>,
    deleted: Vec<String>,
    vservers: Vec<VServer>,
    subnets: HashMap<String, Subnet>,
    /// Port id to subnet id, for instance ports and gateway ports alike.
    port_subnets: HashMap<String, String>,
    interfaces: Vec<GatewayInterface>,
    reports: Vec<AgentStateReport>,
    events: Option<mpsc::UnboundedReceiver<Result<NatEvent>>>,
    calls: HashMap<String, usize>,
    fail_on: HashMap<String, tonic::Code>,
    next_id: usize,
}

impl State {
    fn enter(&mut self, call: &'static str) -> Result<()> {
        *self.calls.entry(call.to_string()).or_default() += 1;
        match self.fail_on.get(call) {
            Some(code) => Err(NatError::rpc(
                call,
                tonic::Status::new(*code, "injected failure"),
            )),
            None => Ok(()),
        }
    }

    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn add_interface(&mut self, subnet_id: &str, use_gateway: bool) -> Result<GatewayInterface> {
        let subnet = self
            .subnets
            .get(subnet_id)
            .cloned()
            .ok_or_else(|| NatError::rpc("AddGatewayInterface", tonic::Status::not_found(subnet_id)))?;
        let used: HashSet<Ipv4Addr> = self
            .interfaces
            .iter()
            .flat_map(|i| i.fixed_ips.iter().copied())
            .collect();
        let ip = match (use_gateway, subnet.gateway_ip) {
            (true, Some(gw)) => Some(gw),
            _ => subnet
                .cidr
                .hosts()
                .find(|ip| Some(*ip) != subnet.gateway_ip && !used.contains(ip)),
        }
        .ok_or_else(|| {
            NatError::rpc(
                "AddGatewayInterface",
                tonic::Status::resource_exhausted("no free address"),
            )
        })?;

        let n = self.next_id();
        let intf = GatewayInterface {
            port_id: format!("gw-{n}"),
            network_id: subnet.network_id.clone(),
            subnet_id: subnet.id.clone(),
            mac_address: format!("fa:16:3e:00:00:{:02x}", n % 256),
            fixed_ips: vec![ip],
            status: InterfaceStatus::Down,
        };
        self.port_subnets
            .insert(intf.port_id.clone(), subnet.id.clone());
        self.interfaces.push(intf.clone());
        Ok(intf)
    }
}

/// Control plane backed by in-memory tables.
///
/// Gateway interfaces stay DOWN unless a test changes them, and created
/// bindings are only recorded.
#[derive(Debug, Clone, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<State>>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    // === Setup ===

    /// Fail every later `call` with UNAVAILABLE.
    pub fn fail_on(&self, call: &str) {
        self.fail_with(call, tonic::Code::Unavailable);
    }

    pub fn fail_with(&self, call: &str, code: tonic::Code) {
        lock(&self.state).fail_on.insert(call.to_string(), code);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).fail_on.clear();
    }

    /// Store a binding scheduled to this agent.
    pub fn add_binding(&self, binding: Binding) {
        lock(&self.state).bindings.push((binding, true));
    }

    /// Keep the binding but schedule it elsewhere.
    pub fn unschedule(&self, id: &str) {
        let mut state = lock(&self.state);
        for (b, here) in state.bindings.iter_mut() {
            if b.id == id {
                *here = false;
            }
        }
    }

    pub fn add_vserver(&self, id: &str, external_ip: Ipv4Addr, external_port: u16, admin_state_up: bool) {
        lock(&self.state).vservers.push(VServer {
            id: id.to_string(),
            external_ip,
            external_port,
            admin_state_up,
        });
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        lock(&self.state).subnets.insert(subnet.id.clone(), subnet);
    }

    /// Put an instance port on a subnet.
    pub fn attach_port(&self, port_id: &str, subnet_id: &str) {
        lock(&self.state)
            .port_subnets
            .insert(port_id.to_string(), subnet_id.to_string());
    }

    /// Allocate a gateway interface directly, as another agent run would have.
    pub fn add_gateway_interface_for(&self, subnet: &Subnet, use_gateway: bool) -> GatewayInterface {
        let mut state = lock(&self.state);
        state.subnets.insert(subnet.id.clone(), subnet.clone());
        match state.add_interface(&subnet.id, use_gateway) {
            Ok(intf) => intf,
            Err(e) => panic!("cannot allocate gateway interface: {e}"),
        }
    }

    pub fn set_interface_status(&self, port_id: &str, status: InterfaceStatus) {
        let mut state = lock(&self.state);
        for intf in state.interfaces.iter_mut().filter(|i| i.port_id == port_id) {
            intf.status = status;
        }
    }

    /// Event sender for the next `watch_events` call.
    pub fn event_channel(&self) -> mpsc::UnboundedSender<Result<NatEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.state).events = Some(rx);
        tx
    }

    // === Inspection ===

    pub fn binding(&self, id: &str) -> Option<Binding> {
        lock(&self.state)
            .bindings
            .iter()
            .find(|(b, _)| b.id == id)
            .map(|(b, _)| b.clone())
    }

    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    pub fn created(&self) -> Vec<NewBinding> {
        lock(&self.state).created.clone()
    }

    pub fn vserver(&self, id: &str) -> Option<VServer> {
        lock(&self.state)
            .vservers
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    pub fn vservers_on(&self, ip: Ipv4Addr) -> Vec<VServer> {
        lock(&self.state)
            .vservers
            .iter()
            .filter(|v| v.external_ip == ip)
            .cloned()
            .collect()
    }

    pub fn gateway_interfaces(&self) -> Vec<GatewayInterface> {
        lock(&self.state).interfaces.clone()
    }

    pub fn reports(&self) -> Vec<AgentStateReport> {
        lock(&self.state).reports.clone()
    }

    pub fn call_count(&self, call: &str) -> usize {
        lock(&self.state).calls.get(call).copied().unwrap_or(0)
    }
}

#[async_trait]
impl VServerStore for FakeControlPlane {
    async fn list_vservers(&self, external_ip: Ipv4Addr) -> Result<Vec<VServer>> {
        let mut state = lock(&self.state);
        state.enter("ListVServers")?;
        Ok(state
            .vservers
            .iter()
            .filter(|v| v.external_ip == external_ip)
            .cloned()
            .collect())
    }

    async fn update_vserver(&self, id: &str, admin_state_up: bool) -> Result<VServer> {
        let mut state = lock(&self.state);
        state.enter("UpdateVServer")?;
        let vs = state
            .vservers
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| NatError::rpc("UpdateVServer", tonic::Status::not_found(id)))?;
        vs.admin_state_up = admin_state_up;
        Ok(vs.clone())
    }

    async fn create_vserver(&self, external_ip: Ipv4Addr, external_port: u16) -> Result<VServer> {
        let mut state = lock(&self.state);
        state.enter("CreateVServer")?;
        if state
            .vservers
            .iter()
            .any(|v| v.external_ip == external_ip && v.external_port == external_port)
        {
            return Err(NatError::rpc(
                "CreateVServer",
                tonic::Status::already_exists(format!("{external_ip}:{external_port}")),
            ));
        }
        let n = state.next_id();
        let vs = VServer {
            id: format!("vs-{n}"),
            external_ip,
            external_port,
            admin_state_up: true,
        };
        state.vservers.push(vs.clone());
        Ok(vs)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn get_active_bindings(&self, scope: BindingScope) -> Result<Vec<Binding>> {
        let mut state = lock(&self.state);
        state.enter("GetActiveBindings")?;
        Ok(state
            .bindings
            .iter()
            .filter(|(b, here)| match scope {
                BindingScope::Agent => *here,
                BindingScope::ExternalIp(ip) => b.external_ip == Some(ip),
            })
            .map(|(b, _)| b.clone())
            .collect())
    }

    async fn get_binding(&self, id: &str) -> Result<Option<Binding>> {
        let mut state = lock(&self.state);
        state.enter("GetBinding")?;
        Ok(state
            .bindings
            .iter()
            .find(|(b, _)| b.id == id)
            .map(|(b, _)| b.clone()))
    }

    async fn update_binding(&self, id: &str, update: &BindingUpdate) -> Result<Binding> {
        let mut state = lock(&self.state);
        state.enter("UpdateBinding")?;
        let (binding, _) = state
            .bindings
            .iter_mut()
            .find(|(b, _)| b.id == id)
            .ok_or_else(|| NatError::rpc("UpdateBinding", tonic::Status::not_found(id)))?;
        update.apply_to(binding);
        Ok(binding.clone())
    }

    async fn delete_binding(&self, id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("DeleteBinding")?;
        state.bindings.retain(|(b, _)| b.id != id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn create_binding(&self, binding: &NewBinding) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("CreateBinding")?;
        state.created.push(binding.clone());
        Ok(())
    }

    async fn add_gateway_interface(
        &self,
        subnet_id: &str,
        use_gateway: bool,
    ) -> Result<GatewayInterface> {
        let mut state = lock(&self.state);
        state.enter("AddGatewayInterface")?;
        state.add_interface(subnet_id, use_gateway)
    }

    async fn remove_gateway_interface(&self, port_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("RemoveGatewayInterface")?;
        state.interfaces.retain(|i| i.port_id != port_id);
        state.port_subnets.remove(port_id);
        Ok(())
    }

    async fn get_gateway_interfaces(
        &self,
        network_id: Option<&str>,
    ) -> Result<Vec<GatewayInterface>> {
        let mut state = lock(&self.state);
        state.enter("GetGatewayInterfaces")?;
        Ok(state
            .interfaces
            .iter()
            .filter(|i| network_id.map_or(true, |n| i.network_id == n))
            .cloned()
            .collect())
    }

    async fn get_subnets_for_ports(&self, port_ids: &[String]) -> Result<Vec<Subnet>> {
        let mut state = lock(&self.state);
        state.enter("GetSubnetsForPorts")?;
        let mut seen = HashSet::new();
        Ok(port_ids
            .iter()
            .filter_map(|p| state.port_subnets.get(p))
            .filter(|s| seen.insert((*s).clone()))
            .filter_map(|s| state.subnets.get(s).cloned())
            .collect())
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<()> {
        let mut state = lock(&self.state);
        state.enter("ReportState")?;
        state.reports.push(report.clone());
        Ok(())
    }

    async fn watch_events(&self) -> Result<EventStream> {
        let mut state = lock(&self.state);
        state.enter("WatchEvents")?;
        let rx = state
            .events
            .take()
            .ok_or_else(|| NatError::rpc("WatchEvents", tonic::Status::unavailable("no stream")))?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}

/// Fixed list of compute hosts.
#[derive(Debug, Clone, Default)]
pub struct FakeInventory {
    hosts: Arc<Mutex<Vec<ComputeHost>>>,
}

impl FakeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host_name: &str, service: &str) {
        lock(&self.hosts).push(ComputeHost {
            host_name: host_name.to_string(),
            service: service.to_string(),
        });
    }
}

#[async_trait]
impl ComputeInventory for FakeInventory {
    async fn list_compute_hosts(&self) -> Result<Vec<ComputeHost>> {
        Ok(lock(&self.hosts).clone())
    }
}
