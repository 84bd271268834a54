//! Compute host inventory.

use async_trait::async_trait;

use super::GrpcControlPlane;
use crate::error::Result;
use crate::model::ComputeHost;
use crate::proto;

/// Service name of hosts that run instances.
pub const COMPUTE_SERVICE: &str = "compute";

/// Source of the hosts that may need a console binding.
#[async_trait]
pub trait ComputeInventory: Send + Sync {
    async fn list_compute_hosts(&self) -> Result<Vec<ComputeHost>>;
}

#[async_trait]
impl ComputeInventory for GrpcControlPlane {
    async fn list_compute_hosts(&self) -> Result<Vec<ComputeHost>> {
        let mut client = self.client();
        let list = self
            .call(
                "ListComputeHosts",
                client.list_compute_hosts(proto::ListComputeHostsRequest {}),
            )
            .await?;
        Ok(list
            .hosts
            .into_iter()
            .map(|h| ComputeHost {
                host_name: h.host_name,
                service: h.service,
            })
            .collect())
    }
}
