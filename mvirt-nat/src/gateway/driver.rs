//! Gateway device drivers.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::error::Result;
use crate::exec::{argv, CommandExecutor};

/// Kernel limit for interface names, without the trailing NUL.
const DEV_NAME_LEN: usize = 14;
const DEV_PREFIX: &str = "qn-";
const PEER_PREFIX: &str = "tap";
const BRIDGE_PREFIX: &str = "brq";

fn truncated(prefix: &str, id: &str) -> String {
    format!("{prefix}{id}").chars().take(DEV_NAME_LEN).collect()
}

/// Name of the gateway device for a port.
pub fn device_name(port_id: &str) -> String {
    truncated(DEV_PREFIX, port_id)
}

/// Plugs gateway ports into the local network fabric.
#[async_trait]
pub trait InterfaceDriver: Send + Sync {
    /// Idempotent existence check.
    async fn device_exists(&self, name: &str) -> Result<bool>;

    async fn plug(&self, network_id: &str, port_id: &str, name: &str, mac: &str) -> Result<()>;

    async fn unplug(&self, name: &str) -> Result<()>;

    /// Replace the addresses of `name` with `cidrs`.
    async fn init_l3(&self, name: &str, cidrs: &[Ipv4Net]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum InterfaceDriverKind {
    /// Internal port on an Open vSwitch bridge.
    Ovs,
    /// veth pair attached to a per-network Linux bridge.
    #[value(name = "linuxbridge")]
    LinuxBridge,
}

impl InterfaceDriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceDriverKind::Ovs => "ovs",
            InterfaceDriverKind::LinuxBridge => "linuxbridge",
        }
    }
}

/// Construct the configured driver.
pub fn build(
    kind: InterfaceDriverKind,
    executor: Arc<dyn CommandExecutor>,
    integration_bridge: &str,
) -> Arc<dyn InterfaceDriver> {
    match kind {
        InterfaceDriverKind::Ovs => Arc::new(OvsDriver::new(executor, integration_bridge)),
        InterfaceDriverKind::LinuxBridge => Arc::new(LinuxBridgeDriver::new(executor)),
    }
}

async fn link_exists(executor: &dyn CommandExecutor, name: &str) -> Result<bool> {
    let out = executor
        .run(&argv(&["ip", "link", "show", name]), None)
        .await?;
    Ok(out.success())
}

async fn set_addresses(executor: &dyn CommandExecutor, name: &str, cidrs: &[Ipv4Net]) -> Result<()> {
    executor
        .check(&argv(&["ip", "addr", "flush", "dev", name]), None)
        .await?;
    for cidr in cidrs {
        executor
            .check(&argv(&["ip", "addr", "add", &cidr.to_string(), "dev", name]), None)
            .await?;
    }
    debug!(device = %name, addresses = cidrs.len(), "Configured addresses");
    Ok(())
}

/// Open vSwitch driver: the gateway is an internal port on the integration bridge.
pub struct OvsDriver {
    executor: Arc<dyn CommandExecutor>,
    bridge: String,
}

impl OvsDriver {
    pub fn new(executor: Arc<dyn CommandExecutor>, bridge: &str) -> Self {
        Self {
            executor,
            bridge: bridge.to_string(),
        }
    }
}

#[async_trait]
impl InterfaceDriver for OvsDriver {
    async fn device_exists(&self, name: &str) -> Result<bool> {
        link_exists(self.executor.as_ref(), name).await
    }

    async fn plug(&self, _network_id: &str, port_id: &str, name: &str, mac: &str) -> Result<()> {
        let iface_id = format!("external-ids:iface-id={port_id}");
        let attached_mac = format!("external-ids:attached-mac={mac}");
        self.executor
            .check(
                &argv(&[
                    "ovs-vsctl",
                    "--may-exist",
                    "add-port",
                    &self.bridge,
                    name,
                    "--",
                    "set",
                    "Interface",
                    name,
                    "type=internal",
                    &iface_id,
                    &attached_mac,
                ]),
                None,
            )
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", name, "address", mac]), None)
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", name, "up"]), None)
            .await?;
        info!(device = %name, bridge = %self.bridge, %port_id, "Plugged OVS gateway port");
        Ok(())
    }

    async fn unplug(&self, name: &str) -> Result<()> {
        self.executor
            .check(
                &argv(&["ovs-vsctl", "--if-exists", "del-port", &self.bridge, name]),
                None,
            )
            .await?;
        info!(device = %name, bridge = %self.bridge, "Unplugged OVS gateway port");
        Ok(())
    }

    async fn init_l3(&self, name: &str, cidrs: &[Ipv4Net]) -> Result<()> {
        set_addresses(self.executor.as_ref(), name, cidrs).await
    }
}

/// Linux bridge driver: a veth pair whose peer is enslaved to the network's bridge.
pub struct LinuxBridgeDriver {
    executor: Arc<dyn CommandExecutor>,
}

impl LinuxBridgeDriver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    async fn ensure_bridge(&self, bridge: &str) -> Result<()> {
        if link_exists(self.executor.as_ref(), bridge).await? {
            return Ok(());
        }
        self.executor
            .check(&argv(&["ip", "link", "add", bridge, "type", "bridge"]), None)
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", bridge, "up"]), None)
            .await?;
        debug!(%bridge, "Created bridge");
        Ok(())
    }
}

#[async_trait]
impl InterfaceDriver for LinuxBridgeDriver {
    async fn device_exists(&self, name: &str) -> Result<bool> {
        link_exists(self.executor.as_ref(), name).await
    }

    async fn plug(&self, network_id: &str, port_id: &str, name: &str, mac: &str) -> Result<()> {
        let peer = truncated(PEER_PREFIX, port_id);
        let bridge = truncated(BRIDGE_PREFIX, network_id);

        self.ensure_bridge(&bridge).await?;
        self.executor
            .check(
                &argv(&["ip", "link", "add", name, "type", "veth", "peer", "name", &peer]),
                None,
            )
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", name, "address", mac]), None)
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", &peer, "master", &bridge]), None)
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", &peer, "up"]), None)
            .await?;
        self.executor
            .check(&argv(&["ip", "link", "set", name, "up"]), None)
            .await?;
        info!(device = %name, %bridge, %port_id, "Plugged bridge gateway port");
        Ok(())
    }

    async fn unplug(&self, name: &str) -> Result<()> {
        // Deleting one end removes the peer too.
        self.executor
            .check(&argv(&["ip", "link", "del", name]), None)
            .await?;
        info!(device = %name, "Unplugged bridge gateway port");
        Ok(())
    }

    async fn init_l3(&self, name: &str, cidrs: &[Ipv4Net]) -> Result<()> {
        set_addresses(self.executor.as_ref(), name, cidrs).await
    }
}
