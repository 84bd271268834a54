//! In-memory interface driver.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::lock;
use crate::error::{NatError, Result};
use crate::gateway::InterfaceDriver;

#[derive(Debug, Default)]
struct DriverState {
    devices: HashSet<String>,
    addresses: HashMap<String, Vec<Ipv4Net>>,
    plugs: usize,
    unplugs: usize,
    /// Operations ("exists", "plug", "unplug", "init_l3") that fail.
    fail_on: HashSet<String>,
}

/// Tracks devices in memory; successful plugs create them, unplugs remove them.
#[derive(Debug, Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<DriverState>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, op: &str) {
        lock(&self.state).fail_on.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).fail_on.clear();
    }

    pub fn add_device(&self, name: &str) {
        lock(&self.state).devices.insert(name.to_string());
    }

    pub fn has_device(&self, name: &str) -> bool {
        lock(&self.state).devices.contains(name)
    }

    pub fn devices(&self) -> HashSet<String> {
        lock(&self.state).devices.clone()
    }

    pub fn addresses(&self, name: &str) -> Vec<Ipv4Net> {
        lock(&self.state)
            .addresses
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful plugs so far.
    pub fn plug_count(&self) -> usize {
        lock(&self.state).plugs
    }

    pub fn unplug_count(&self) -> usize {
        lock(&self.state).unplugs
    }

    fn check(state: &DriverState, op: &str, name: &str) -> Result<()> {
        if state.fail_on.contains(op) {
            return Err(NatError::CommandFailed {
                cmd: format!("{op} {name}"),
                code: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InterfaceDriver for FakeDriver {
    async fn device_exists(&self, name: &str) -> Result<bool> {
        let state = lock(&self.state);
        Self::check(&state, "exists", name)?;
        Ok(state.devices.contains(name))
    }

    async fn plug(&self, _network_id: &str, _port_id: &str, name: &str, _mac: &str) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check(&state, "plug", name)?;
        state.devices.insert(name.to_string());
        state.plugs += 1;
        Ok(())
    }

    async fn unplug(&self, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check(&state, "unplug", name)?;
        state.devices.remove(name);
        state.addresses.remove(name);
        state.unplugs += 1;
        Ok(())
    }

    async fn init_l3(&self, name: &str, cidrs: &[Ipv4Net]) -> Result<()> {
        let mut state = lock(&self.state);
        Self::check(&state, "init_l3", name)?;
        state.addresses.insert(name.to_string(), cidrs.to_vec());
        Ok(())
    }
}
