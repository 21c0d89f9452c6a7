//! Network fault injection for dt agents.
//!
//! This library provides:
//! - The [`PortFaultProvider`] interface the agent forwards drop/recover
//!   requests to
//! - An iptables-backed provider that blocks and restores a single TCP port
//! - A recording provider for tests and dry runs
//!
//! Faults are keyed by a single port. Rules are installed for both directions
//! so that the instance can neither accept nor originate traffic on the port
//! while the fault is active.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;

mod iptables;
mod recording;

pub use iptables::IptablesProvider;
pub use recording::{FaultCall, RecordingProvider};

/// Fault injection errors.
#[derive(Debug, Error)]
pub enum FaultError {
    /// The port argument is not a usable TCP port.
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// The firewall command ran but reported failure.
    #[error("{program} {args} failed: {stderr}")]
    Command {
        program: String,
        args: String,
        stderr: String,
    },

    /// The firewall command could not be executed at all.
    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),

    /// Injected failure from a test provider.
    #[error("fault provider failure: {0}")]
    Injected(String),
}

/// A validated, non-zero TCP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(u16);

impl Port {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl FromStr for Port {
    type Err = FaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(FaultError::InvalidPort(s.to_string())),
            Ok(port) => Ok(Self(port)),
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provider of port-level network faults.
#[async_trait]
pub trait PortFaultProvider: Send + Sync {
    /// Start dropping traffic on `port`.
    async fn drop_port(&self, port: &str) -> Result<(), FaultError>;

    /// Stop dropping traffic on `port`.
    async fn recover_port(&self, port: &str) -> Result<(), FaultError>;
}
