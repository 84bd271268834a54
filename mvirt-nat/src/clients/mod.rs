//! Clients for the control plane.
//!
//! - control_plane: bindings, vservers, gateway interfaces, state reports and events
//! - compute: compute host inventory for console bindings

pub mod compute;
pub mod control_plane;

pub use compute::{ComputeInventory, COMPUTE_SERVICE};
pub use control_plane::{BindingScope, ControlPlane, EventStream, GrpcControlPlane};
