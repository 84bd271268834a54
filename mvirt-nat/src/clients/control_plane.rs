//! Client for the control plane's NAT plugin service.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::error::{NatError, Result};
use crate::model::{
    AgentStateReport, Binding, BindingKind, BindingStatus, BindingUpdate, GatewayInterface,
    InterfaceStatus, NatEvent, NewBinding, Subnet, VServer,
};
use crate::proto;
use crate::proto::nat_plugin_service_client::NatPluginServiceClient;
use crate::vserver::{assign_vserver, VServerStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which bindings a pull returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingScope {
    /// Bindings scheduled to this agent's host.
    Agent,
    /// Every active binding already using this external address.
    ExternalIp(Ipv4Addr),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<NatEvent>> + Send>>;

/// Control-plane calls the agent relies on.
#[async_trait]
pub trait ControlPlane: VServerStore {
    async fn get_active_bindings(&self, scope: BindingScope) -> Result<Vec<Binding>>;

    /// The stored binding, or `None` if it no longer exists.
    async fn get_binding(&self, id: &str) -> Result<Option<Binding>>;

    /// Reuse or allocate a vserver on `external_ip`.
    async fn get_vserver(&self, external_ip: Ipv4Addr, start_port: u16) -> Result<VServer> {
        assign_vserver(self, external_ip, start_port).await
    }

    async fn update_binding(&self, id: &str, update: &BindingUpdate) -> Result<Binding>;

    async fn delete_binding(&self, id: &str) -> Result<()>;

    async fn create_binding(&self, binding: &NewBinding) -> Result<()>;

    async fn add_gateway_interface(
        &self,
        subnet_id: &str,
        use_gateway: bool,
    ) -> Result<GatewayInterface>;

    async fn remove_gateway_interface(&self, port_id: &str) -> Result<()>;

    /// Gateway interfaces of this host, optionally limited to one network.
    async fn get_gateway_interfaces(&self, network_id: Option<&str>)
        -> Result<Vec<GatewayInterface>>;

    async fn get_subnets_for_ports(&self, port_ids: &[String]) -> Result<Vec<Subnet>>;

    async fn report_state(&self, report: &AgentStateReport) -> Result<()>;

    /// Subscribe to binding notifications for this host.
    async fn watch_events(&self) -> Result<EventStream>;
}

/// gRPC implementation of [`ControlPlane`].
#[derive(Clone)]
pub struct GrpcControlPlane {
    client: NatPluginServiceClient<Channel>,
    host: String,
    rpc_timeout: Duration,
}

impl GrpcControlPlane {
    /// Create a client. The channel connects on first use and reconnects on its own.
    pub fn connect_lazy(endpoint: &str, host: &str, rpc_timeout: Duration) -> Result<Self> {
        info!(%endpoint, %host, "Using control plane");
        let channel = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(CONNECT_TIMEOUT)
            .connect_lazy();
        Ok(Self {
            client: NatPluginServiceClient::new(channel),
            host: host.to_string(),
            rpc_timeout,
        })
    }

    pub(crate) fn client(&self) -> NatPluginServiceClient<Channel> {
        self.client.clone()
    }

    /// Await an RPC with the per-call timeout.
    pub(crate) async fn call<T, F>(&self, name: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
    {
        debug!(call = name, "Control plane call");
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(NatError::rpc(name, status)),
            Err(_) => Err(NatError::Timeout {
                what: format!("control plane call {name}"),
                after: self.rpc_timeout,
            }),
        }
    }
}

#[async_trait]
impl VServerStore for GrpcControlPlane {
    async fn list_vservers(&self, external_ip: Ipv4Addr) -> Result<Vec<VServer>> {
        let mut client = self.client();
        let list = self
            .call(
                "ListVServers",
                client.list_v_servers(proto::ListVServersRequest {
                    external_ip: external_ip.to_string(),
                }),
            )
            .await?;
        list.vservers.into_iter().map(VServer::try_from).collect()
    }

    async fn update_vserver(&self, id: &str, admin_state_up: bool) -> Result<VServer> {
        let mut client = self.client();
        let vs = self
            .call(
                "UpdateVServer",
                client.update_v_server(proto::UpdateVServerRequest {
                    vserver_id: id.to_string(),
                    admin_state_up,
                }),
            )
            .await?;
        VServer::try_from(vs)
    }

    async fn create_vserver(&self, external_ip: Ipv4Addr, external_port: u16) -> Result<VServer> {
        let mut client = self.client();
        let vs = self
            .call(
                "CreateVServer",
                client.create_v_server(proto::CreateVServerRequest {
                    external_ip: external_ip.to_string(),
                    external_port: external_port.into(),
                }),
            )
            .await?;
        VServer::try_from(vs)
    }
}

#[async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn get_active_bindings(&self, scope: BindingScope) -> Result<Vec<Binding>> {
        let external_ip = match scope {
            BindingScope::Agent => None,
            BindingScope::ExternalIp(ip) => Some(ip.to_string()),
        };
        let mut client = self.client();
        let list = self
            .call(
                "GetActiveBindings",
                client.get_active_bindings(proto::GetActiveBindingsRequest {
                    host: self.host.clone(),
                    external_ip,
                }),
            )
            .await?;
        list.bindings.into_iter().map(Binding::try_from).collect()
    }

    async fn get_binding(&self, id: &str) -> Result<Option<Binding>> {
        let mut client = self.client();
        let result = self
            .call(
                "GetBinding",
                client.get_binding(proto::GetBindingRequest {
                    binding_id: id.to_string(),
                }),
            )
            .await;
        match result {
            Ok(binding) => Binding::try_from(binding).map(Some),
            Err(e) if e.rpc_code() == Some(tonic::Code::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_binding(&self, id: &str, update: &BindingUpdate) -> Result<Binding> {
        let mut client = self.client();
        let binding = self
            .call(
                "UpdateBinding",
                client.update_binding(proto::UpdateBindingRequest {
                    binding_id: id.to_string(),
                    external_ip: update.external_ip.map(|ip| ip.to_string()),
                    external_port: update.external_port.map(u32::from),
                    vserver_id: update.vserver_id.clone(),
                    gateway: update.gateway.map(|ip| ip.to_string()),
                    device_id: update.device_id.clone(),
                    status: update.status.map(|s| proto::BindingStatus::from(s) as i32),
                    admin_state_up: update.admin_state_up,
                }),
            )
            .await?;
        Binding::try_from(binding)
    }

    async fn delete_binding(&self, id: &str) -> Result<()> {
        let mut client = self.client();
        self.call(
            "DeleteBinding",
            client.delete_binding(proto::DeleteBindingRequest {
                binding_id: id.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn create_binding(&self, binding: &NewBinding) -> Result<()> {
        let mut client = self.client();
        self.call(
            "CreateBinding",
            client.create_binding(proto::CreateBindingRequest {
                fixed_ip: binding.fixed_ip.to_string(),
                kind: proto::BindingKind::from(binding.kind) as i32,
                fixed_port: binding.fixed_port.map(u32::from),
                device_id: binding.device_id.clone(),
                port_id: binding.port_id.clone(),
                tenant_id: binding.tenant_id.clone(),
                shared: binding.shared,
            }),
        )
        .await?;
        Ok(())
    }

    async fn add_gateway_interface(
        &self,
        subnet_id: &str,
        use_gateway: bool,
    ) -> Result<GatewayInterface> {
        let mut client = self.client();
        let intf = self
            .call(
                "AddGatewayInterface",
                client.add_gateway_interface(proto::AddGatewayInterfaceRequest {
                    subnet_id: subnet_id.to_string(),
                    host: self.host.clone(),
                    use_gateway,
                }),
            )
            .await?;
        GatewayInterface::try_from(intf)
    }

    async fn remove_gateway_interface(&self, port_id: &str) -> Result<()> {
        let mut client = self.client();
        self.call(
            "RemoveGatewayInterface",
            client.remove_gateway_interface(proto::RemoveGatewayInterfaceRequest {
                port_id: port_id.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn get_gateway_interfaces(
        &self,
        network_id: Option<&str>,
    ) -> Result<Vec<GatewayInterface>> {
        let mut client = self.client();
        let list = self
            .call(
                "GetGatewayInterfaces",
                client.get_gateway_interfaces(proto::GetGatewayInterfacesRequest {
                    host: self.host.clone(),
                    network_id: network_id.map(str::to_string),
                }),
            )
            .await?;
        list.interfaces
            .into_iter()
            .map(GatewayInterface::try_from)
            .collect()
    }

    async fn get_subnets_for_ports(&self, port_ids: &[String]) -> Result<Vec<Subnet>> {
        let mut client = self.client();
        let list = self
            .call(
                "GetSubnetsForPorts",
                client.get_subnets_for_ports(proto::GetSubnetsForPortsRequest {
                    port_ids: port_ids.to_vec(),
                }),
            )
            .await?;
        list.subnets.into_iter().map(Subnet::try_from).collect()
    }

    async fn report_state(&self, report: &AgentStateReport) -> Result<()> {
        let mut client = self.client();
        self.call(
            "ReportState",
            client.report_state(proto::ReportStateRequest {
                host: report.host.clone(),
                agent_id: report.agent_id.clone(),
                binary: report.binary.clone(),
                start_flag: report.start_flag,
                configurations: report.configurations.clone().into_iter().collect(),
                bindings: u32::try_from(report.bindings).unwrap_or(u32::MAX),
                reported_at_ms: report.reported_at.timestamp_millis(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn watch_events(&self) -> Result<EventStream> {
        let mut client = self.client();
        let stream = self
            .call(
                "WatchEvents",
                client.watch_events(proto::WatchEventsRequest {
                    host: self.host.clone(),
                }),
            )
            .await?;
        Ok(Box::pin(stream.map(|item| match item {
            Ok(event) => NatEvent::try_from(event),
            Err(status) => Err(NatError::rpc("WatchEvents", status)),
        })))
    }
}

// === Proto conversions ===

fn parse_ip(kind: &'static str, field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| NatError::invalid(kind, format!("{field}: invalid IPv4 address {value:?}")))
}

fn parse_opt_ip(kind: &'static str, field: &str, value: Option<String>) -> Result<Option<Ipv4Addr>> {
    non_empty(value)
        .map(|v| parse_ip(kind, field, &v))
        .transpose()
}

fn parse_port(kind: &'static str, field: &str, value: u32) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| NatError::invalid(kind, format!("{field}: port {value} out of range")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl From<BindingKind> for proto::BindingKind {
    fn from(kind: BindingKind) -> Self {
        match kind {
            BindingKind::Instance => proto::BindingKind::Instance,
            BindingKind::Hypervisor => proto::BindingKind::Hypervisor,
        }
    }
}

impl From<BindingStatus> for proto::BindingStatus {
    fn from(status: BindingStatus) -> Self {
        match status {
            BindingStatus::Active => proto::BindingStatus::Active,
            BindingStatus::Inactive => proto::BindingStatus::Inactive,
        }
    }
}

impl TryFrom<proto::Binding> for Binding {
    type Error = NatError;

    fn try_from(b: proto::Binding) -> Result<Self> {
        const KIND: &str = "binding";
        if b.id.is_empty() {
            return Err(NatError::invalid(KIND, "missing id"));
        }
        let kind = match proto::BindingKind::try_from(b.kind) {
            Ok(proto::BindingKind::Instance) => BindingKind::Instance,
            Ok(proto::BindingKind::Hypervisor) => BindingKind::Hypervisor,
            _ => return Err(NatError::invalid(KIND, format!("{}: unknown kind {}", b.id, b.kind))),
        };
        let status = match proto::BindingStatus::try_from(b.status) {
            Ok(proto::BindingStatus::Active) => BindingStatus::Active,
            Ok(proto::BindingStatus::Inactive) => BindingStatus::Inactive,
            _ => {
                return Err(NatError::invalid(
                    KIND,
                    format!("{}: unknown status {}", b.id, b.status),
                ))
            }
        };
        Ok(Binding {
            kind,
            device_id: non_empty(b.device_id),
            external_ip: parse_opt_ip(KIND, "external_ip", b.external_ip)?,
            external_port: b
                .external_port
                .map(|p| parse_port(KIND, "external_port", p))
                .transpose()?,
            fixed_ip: parse_opt_ip(KIND, "fixed_ip", b.fixed_ip)?,
            fixed_port: b
                .fixed_port
                .map(|p| parse_port(KIND, "fixed_port", p))
                .transpose()?,
            gateway: parse_opt_ip(KIND, "gateway", b.gateway)?,
            vserver_id: non_empty(b.vserver_id),
            status,
            admin_state_up: b.admin_state_up,
            shared: b.shared,
            tenant_id: non_empty(b.tenant_id),
            port_id: non_empty(b.port_id),
            id: b.id,
        })
    }
}

impl TryFrom<proto::VServer> for VServer {
    type Error = NatError;

    fn try_from(vs: proto::VServer) -> Result<Self> {
        const KIND: &str = "vserver";
        if vs.id.is_empty() {
            return Err(NatError::invalid(KIND, "missing id"));
        }
        Ok(VServer {
            external_ip: parse_ip(KIND, "external_ip", &vs.external_ip)?,
            external_port: parse_port(KIND, "external_port", vs.external_port)?,
            admin_state_up: vs.admin_state_up,
            id: vs.id,
        })
    }
}

impl TryFrom<proto::GatewayInterface> for GatewayInterface {
    type Error = NatError;

    fn try_from(intf: proto::GatewayInterface) -> Result<Self> {
        const KIND: &str = "gateway interface";
        if intf.port_id.is_empty() {
            return Err(NatError::invalid(KIND, "missing port_id"));
        }
        let status = match proto::InterfaceStatus::try_from(intf.status) {
            Ok(proto::InterfaceStatus::Active) => InterfaceStatus::Active,
            // Unknown status is treated as not plumbed yet.
            _ => InterfaceStatus::Down,
        };
        let fixed_ips = intf
            .fixed_ips
            .iter()
            .map(|ip| parse_ip(KIND, "fixed_ips", ip))
            .collect::<Result<Vec<_>>>()?;
        Ok(GatewayInterface {
            port_id: intf.port_id,
            network_id: intf.network_id,
            subnet_id: intf.subnet_id,
            mac_address: intf.mac_address,
            fixed_ips,
            status,
        })
    }
}

impl TryFrom<proto::Subnet> for Subnet {
    type Error = NatError;

    fn try_from(s: proto::Subnet) -> Result<Self> {
        const KIND: &str = "subnet";
        let cidr = s
            .cidr
            .parse()
            .map_err(|_| NatError::invalid(KIND, format!("{}: invalid cidr {:?}", s.id, s.cidr)))?;
        Ok(Subnet {
            gateway_ip: parse_opt_ip(KIND, "gateway_ip", s.gateway_ip)?,
            cidr,
            id: s.id,
            network_id: s.network_id,
        })
    }
}

impl TryFrom<proto::NatEvent> for NatEvent {
    type Error = NatError;

    fn try_from(ev: proto::NatEvent) -> Result<Self> {
        use proto::nat_event::Event;

        const KIND: &str = "event";
        match ev.event {
            Some(Event::BindingCreated(e)) => e
                .binding
                .ok_or_else(|| NatError::invalid(KIND, "binding_created without binding"))
                .and_then(Binding::try_from)
                .map(NatEvent::BindingCreated),
            Some(Event::BindingDeleted(e)) => e
                .binding
                .ok_or_else(|| NatError::invalid(KIND, "binding_deleted without binding"))
                .and_then(Binding::try_from)
                .map(NatEvent::BindingDeleted),
            Some(Event::AgentUpdated(e)) => Ok(NatEvent::AgentUpdated {
                admin_state_up: e.admin_state_up,
            }),
            None => Err(NatError::invalid(KIND, "empty event")),
        }
    }
}
