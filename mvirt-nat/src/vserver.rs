//! External endpoint allocation.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{NatError, Result};
use crate::model::VServer;

/// Control-plane storage of vservers.
#[async_trait]
pub trait VServerStore: Send + Sync {
    /// Every vserver on `external_ip`, in storage order.
    async fn list_vservers(&self, external_ip: Ipv4Addr) -> Result<Vec<VServer>>;

    async fn update_vserver(&self, id: &str, admin_state_up: bool) -> Result<VServer>;

    async fn create_vserver(&self, external_ip: Ipv4Addr, external_port: u16) -> Result<VServer>;
}

/// Pick a vserver on `external_ip` for a new binding.
///
/// The first administratively down vserver is reclaimed. Otherwise a new one
/// is created one above the highest port in use, never below
/// `start_port + 1`. Not safe against concurrent callers on the same address:
/// run it under the agent lock.
pub async fn assign_vserver<S>(store: &S, external_ip: Ipv4Addr, start_port: u16) -> Result<VServer>
where
    S: VServerStore + ?Sized,
{
    let existing = store.list_vservers(external_ip).await?;

    let mut max_port = start_port;
    for vs in &existing {
        if !vs.admin_state_up {
            info!(vserver_id = %vs.id, port = vs.external_port, "Reclaiming vserver");
            let mut reclaimed = store.update_vserver(&vs.id, true).await?;
            // Keep the recorded endpoint even if the store echoes less.
            reclaimed.external_ip = vs.external_ip;
            reclaimed.external_port = vs.external_port;
            return Ok(reclaimed);
        }
        max_port = max_port.max(vs.external_port);
    }

    let port = max_port
        .checked_add(1)
        .ok_or(NatError::PortsExhausted(external_ip))?;
    debug!(%external_ip, port, in_use = existing.len(), "Allocating new vserver");
    store.create_vserver(external_ip, port).await
}
