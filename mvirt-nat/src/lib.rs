//! mvirt-nat: node-local NAT agent.
//!
//! Keeps this host's iptables or IPVS state in line with the vnat bindings
//! the control plane assigns to it, and plumbs the gateway interfaces backend
//! return traffic needs.

pub mod agent;
pub mod audit;
pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod exec;
pub mod gateway;
pub mod model;
pub mod proto;
pub mod rules;
pub mod test_util;
pub mod vserver;

pub use agent::{NatAgent, TickOutcome};
pub use error::{NatError, Result};
