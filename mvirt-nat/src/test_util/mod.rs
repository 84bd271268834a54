//! Stateful fakes for the agent's collaborators.
//!
//! Every fake is cheap to clone and shares its state between clones, so a
//! test keeps one handle for assertions and hands another to the agent.

pub mod control_plane;
pub mod driver;
pub mod executor;

use std::net::Ipv4Addr;

pub use control_plane::{FakeControlPlane, FakeInventory};
pub use driver::FakeDriver;
pub use executor::{RecordedCommand, RecordingExecutor};

use crate::model::{Binding, BindingKind};

/// An instance binding forwarding to `fixed_ip:fixed_port`, not yet assigned.
pub fn new_binding(id: &str, fixed_ip: Ipv4Addr, fixed_port: u16) -> Binding {
    let mut binding = Binding::new(id, BindingKind::Instance);
    binding.fixed_ip = Some(fixed_ip);
    binding.fixed_port = Some(fixed_port);
    binding
}

/// Lock a std mutex, ignoring poisoning from a panicked test thread.
fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
