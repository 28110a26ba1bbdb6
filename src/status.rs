//! Authoritative VPN status owned by the daemon loop.
//!
//! All fields are mutated only through the daemon's change-detecting
//! setters; everything else reads a mirror published on the desktop bus.

use crate::vpnconfig::VpnConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trusted network detection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrustedNetwork {
    #[default]
    Unknown,
    NotTrusted,
    Trusted,
}

impl TrustedNetwork {
    /// Check if the current network is trusted
    pub fn trusted(self) -> bool {
        self == TrustedNetwork::Trusted
    }
}

impl fmt::Display for TrustedNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustedNetwork::Unknown => "unknown",
            TrustedNetwork::NotTrusted => "not trusted",
            TrustedNetwork::Trusted => "trusted",
        };
        write!(f, "{}", s)
    }
}

/// VPN connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Unknown,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    /// Check if the VPN is connected
    pub fn connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        write!(f, "{}", s)
    }
}

/// Supervision state of the external VPN transport process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OcRunning {
    #[default]
    Unknown,
    NotRunning,
    Running,
}

impl OcRunning {
    /// Check if the transport is supervised
    pub fn running(self) -> bool {
        self == OcRunning::Running
    }
}

impl fmt::Display for OcRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OcRunning::Unknown => "unknown",
            OcRunning::NotRunning => "not running",
            OcRunning::Running => "running",
        };
        write!(f, "{}", s)
    }
}

/// VPN status of the daemon.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub trusted_network: TrustedNetwork,
    pub connection_state: ConnectionState,
    pub oc_running: OcRunning,
    /// Address assigned to the tunnel device, empty when not connected
    pub ip: String,
    /// Tunnel device name, empty when not connected
    pub device: String,
    /// Connection time in epoch seconds, 0 when not connected
    pub connected_at: i64,
    /// VPN server hostnames from the current profile
    pub servers: Vec<String>,
    /// Active tunnel configuration
    pub vpn_config: Option<VpnConfig>,
}

impl Status {
    pub fn new() -> Self {
        Self::default()
    }
}
