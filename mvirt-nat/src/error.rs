//! Agent error types.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the NAT agent.
///
/// Everything except [`NatError::Config`] is retryable: the reconciliation
/// loop turns it into a pending resync instead of stopping the agent.
#[derive(Debug, Error)]
pub enum NatError {
    /// A control-plane call returned an error status.
    #[error("control plane call {call} failed: {status}")]
    Rpc {
        call: &'static str,
        #[source]
        status: tonic::Status,
    },

    /// The control-plane endpoint could not be set up.
    #[error("control plane transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// An RPC or privileged command did not finish in time.
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    /// A privileged command exited unsuccessfully.
    #[error("command `{cmd}` failed (status {code:?}): {stderr}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A payload from the control plane is missing a field or carries an invalid value.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    /// A gateway port was returned without any fixed address.
    #[error("gateway port {0} has no IP address")]
    NoGatewayAddress(String),

    /// Plumbing a gateway device failed.
    #[error("device {device}: {reason}")]
    Device { device: String, reason: String },

    /// No external port left above the allocation start on this address.
    #[error("no free external port left on {0}")]
    PortsExhausted(Ipv4Addr),

    #[error("configuration error: {0}")]
    Config(String),
}

impl NatError {
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        NatError::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }

    pub fn rpc(call: &'static str, status: tonic::Status) -> Self {
        NatError::Rpc { call, status }
    }

    /// Whether the next reconciliation tick may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NatError::Config(_))
    }

    /// The gRPC status code, if this error came from the control plane.
    pub fn rpc_code(&self) -> Option<tonic::Code> {
        match self {
            NatError::Rpc { status, .. } => Some(status.code()),
            _ => None,
        }
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, NatError>;
