//! Gateway interfaces: the per-subnet ports this agent plumbs so backend
//! return traffic routes through it.

pub mod driver;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::audit::NatAuditLogger;
use crate::clients::ControlPlane;
use crate::error::{NatError, Result};
use crate::exec::{argv, CommandExecutor};
use crate::model::{GatewayInterface, InterfaceStatus, Subnet};

pub use driver::{device_name, InterfaceDriver, InterfaceDriverKind};

pub struct GatewayManager {
    control_plane: Arc<dyn ControlPlane>,
    driver: Arc<dyn InterfaceDriver>,
    executor: Arc<dyn CommandExecutor>,
    audit: Arc<NatAuditLogger>,
    arp_count: i32,
    use_gateway: bool,
    /// Ports plumbed by this process while the control plane still reports DOWN.
    plumbed: HashSet<String>,
}

impl GatewayManager {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        driver: Arc<dyn InterfaceDriver>,
        executor: Arc<dyn CommandExecutor>,
        audit: Arc<NatAuditLogger>,
        arp_count: i32,
        use_gateway: bool,
    ) -> Self {
        Self {
            control_plane,
            driver,
            executor,
            audit,
            arp_count,
            use_gateway,
            plumbed: HashSet::new(),
        }
    }

    /// Make sure `subnet`'s network has a plumbed gateway interface.
    ///
    /// Reuses the first interface on the network or asks the control plane for
    /// a new one. A DOWN interface is plumbed once; later calls are no-ops.
    pub async fn ensure_gateway(&mut self, subnet: &Subnet) -> Result<GatewayInterface> {
        let existing = self
            .control_plane
            .get_gateway_interfaces(Some(&subnet.network_id))
            .await?;
        let mut intf = match existing.into_iter().next() {
            Some(intf) => intf,
            None => {
                info!(subnet_id = %subnet.id, network_id = %subnet.network_id, "Adding gateway interface");
                self.control_plane
                    .add_gateway_interface(&subnet.id, self.use_gateway)
                    .await?
            }
        };

        if intf.status == InterfaceStatus::Down && !self.plumbed.contains(&intf.port_id) {
            self.plumb(subnet, &intf).await?;
            self.plumbed.insert(intf.port_id.clone());
            intf.status = InterfaceStatus::Active;
        }
        Ok(intf)
    }

    async fn plumb(&self, subnet: &Subnet, intf: &GatewayInterface) -> Result<()> {
        let name = device_name(&intf.port_id);
        let cidr = intf.ip_cidr(subnet)?;
        let device_err = |e: NatError| NatError::Device {
            device: name.clone(),
            reason: e.to_string(),
        };

        if !self.driver.device_exists(&name).await.map_err(device_err)? {
            self.driver
                .plug(&subnet.network_id, &intf.port_id, &name, &intf.mac_address)
                .await
                .map_err(device_err)?;
        }
        self.driver
            .init_l3(&name, &[cidr])
            .await
            .map_err(device_err)?;
        self.send_gratuitous_arp(&name, cidr.addr()).await;

        self.audit
            .gateway_plugged(&intf.port_id, &name, &cidr.to_string());
        Ok(())
    }

    /// The internal gateway address for traffic toward `port_id`.
    ///
    /// Without a port, or when the port has no subnet, this is `default`.
    pub async fn gateway_for_port(
        &mut self,
        port_id: Option<&str>,
        default: Ipv4Addr,
    ) -> Result<Ipv4Addr> {
        let Some(port_id) = port_id else {
            return Ok(default);
        };
        let subnets = self
            .control_plane
            .get_subnets_for_ports(&[port_id.to_string()])
            .await?;
        let Some(subnet) = subnets.first() else {
            debug!(%port_id, "Port has no subnet, using default gateway");
            return Ok(default);
        };
        self.ensure_gateway(subnet).await?.address()
    }

    /// Unplug the device of an orphaned gateway interface.
    pub async fn remove_gateway(&mut self, intf: &GatewayInterface) -> Result<()> {
        let name = device_name(&intf.port_id);
        let device_err = |e: NatError| NatError::Device {
            device: name.clone(),
            reason: e.to_string(),
        };

        if self.driver.device_exists(&name).await.map_err(device_err)? {
            self.driver.unplug(&name).await.map_err(device_err)?;
            self.audit.gateway_unplugged(&intf.port_id, &name);
        } else {
            debug!(device = %name, "Gateway device already gone");
        }
        self.plumbed.remove(&intf.port_id);
        Ok(())
    }

    async fn send_gratuitous_arp(&self, name: &str, ip: Ipv4Addr) {
        if self.arp_count <= 0 {
            return;
        }
        let count = self.arp_count.to_string();
        let ip = ip.to_string();
        if let Err(e) = self
            .executor
            .check(
                &argv(&["arping", "-A", "-U", "-I", name, "-c", &count, &ip]),
                None,
            )
            .await
        {
            error!(device = %name, error = %e, "Failed sending gratuitous ARP");
        }
    }
}
