//! Shared setup for agent tests: a real agent and real rule backends over
//! in-memory fakes.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use mvirt_nat::audit::NatAuditLogger;
use mvirt_nat::config::AgentConfig;
use mvirt_nat::gateway::{GatewayManager, InterfaceDriverKind};
use mvirt_nat::model::{Binding, Subnet};
use mvirt_nat::rules::{self, RuleBackend};
use mvirt_nat::test_util::{FakeControlPlane, FakeDriver, FakeInventory, RecordingExecutor};
use mvirt_nat::NatAgent;

pub const EXTERNAL_IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);
pub const INTERNAL_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

pub struct Harness {
    pub cp: FakeControlPlane,
    pub inventory: FakeInventory,
    pub driver: FakeDriver,
    pub exec: RecordingExecutor,
    pub agent: Arc<NatAgent>,
}

pub fn harness(backend: RuleBackend) -> Harness {
    harness_with(backend, |_| {})
}

pub fn harness_with(backend: RuleBackend, configure: impl FnOnce(&mut AgentConfig)) -> Harness {
    let _ = tracing_subscriber::fmt::try_init();

    let cp = FakeControlPlane::new();
    let inventory = FakeInventory::new();
    let driver = FakeDriver::new();
    let exec = RecordingExecutor::new();

    let mut config = AgentConfig::new("node-1", InterfaceDriverKind::Ovs, backend);
    config.local_external_ip = EXTERNAL_IP;
    config.local_internal_ip = INTERNAL_IP;
    config.external_port_start = 10000;
    config.resync_interval = Duration::from_millis(10);
    config.report_interval = Duration::from_millis(10);
    configure(&mut config);

    let audit = Arc::new(NatAuditLogger::new("node-1"));
    let gateways = GatewayManager::new(
        Arc::new(cp.clone()),
        Arc::new(driver.clone()),
        Arc::new(exec.clone()),
        Arc::clone(&audit),
        0,
        backend.uses_subnet_gateway(),
    );
    let agent = NatAgent::new(
        config,
        Arc::new(cp.clone()),
        Arc::new(inventory.clone()),
        rules::build(backend, Arc::new(exec.clone())),
        gateways,
        audit,
    );

    Harness {
        cp,
        inventory,
        driver,
        exec,
        agent: Arc::new(agent),
    }
}

pub fn subnet(id: &str, network_id: &str) -> Subnet {
    Subnet {
        id: id.to_string(),
        network_id: network_id.to_string(),
        cidr: "10.0.0.0/24".parse().unwrap(),
        gateway_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
    }
}

/// An unassigned binding forwarding to `10.0.0.<host>:<port>`.
pub fn backend_binding(id: &str, host: u8, port: u16) -> Binding {
    mvirt_nat::test_util::new_binding(id, Ipv4Addr::new(10, 0, 0, host), port)
}

pub fn dnat_line(external_port: u16, fixed: &str) -> String {
    format!(
        "-A mvirt-nat-PREROUTING -d {EXTERNAL_IP} -p tcp -m tcp --dport {external_port} -j DNAT --to-destination {fixed}"
    )
}

pub fn snat_line(fixed_ip: &str, fixed_port: u16, gateway: Ipv4Addr) -> String {
    format!(
        "-A mvirt-nat-POSTROUTING -d {fixed_ip} -p tcp -m tcp --dport {fixed_port} -j SNAT --to-source {gateway}"
    )
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
