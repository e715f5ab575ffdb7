// Common types for the DicyVPN client

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tunnel protocol requested from the remote service
pub const WIREGUARD_PROTOCOL: &str = "wireguard";

/// Server tier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerTier {
    /// Shared capacity, the service tracks connect/disconnect per account
    Primary,
    /// Best-effort, no disconnect accounting
    Secondary,
}

impl ServerTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerTier::Primary => "primary",
            ServerTier::Secondary => "secondary",
        }
    }
}

impl fmt::Display for ServerTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server descriptor as received from the catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Server {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub tier: ServerTier,
    pub country: String,
    pub city: String,
    /// Load fraction in [0, 1]
    #[serde(default)]
    pub load: f64,
}

impl Server {
    pub fn is_primary(&self) -> bool {
        self.tier == ServerTier::Primary
    }
}

/// Server catalog, grouped by key (usually a country code)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerList {
    #[serde(default)]
    pub primary: BTreeMap<String, Vec<Server>>,
    #[serde(default)]
    pub secondary: BTreeMap<String, Vec<Server>>,
}

impl ServerList {
    /// Iterate over every server, primary collection first
    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.primary
            .values()
            .chain(self.secondary.values())
            .flat_map(|servers| servers.iter())
    }

    /// Look up a server by id in both collections
    pub fn find(&self, id: &str) -> Option<&Server> {
        self.iter().find(|server| server.id == id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Body of the connect and disconnect requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRequest {
    #[serde(rename = "type")]
    pub tier: String,
    pub protocol: String,
}

impl ConnectionRequest {
    /// WireGuard request for the given server
    pub fn wireguard(server: &Server) -> Self {
        Self {
            tier: server.tier.as_str().to_string(),
            protocol: WIREGUARD_PROTOCOL.to_string(),
        }
    }
}

/// UDP/TCP ports offered for one tunnel protocol
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolPorts {
    #[serde(default)]
    pub udp: Vec<u16>,
    #[serde(default)]
    pub tcp: Vec<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ports {
    #[serde(default)]
    pub wireguard: ProtocolPorts,
    #[serde(default)]
    pub openvpn: ProtocolPorts,
}

/// Credentials and addressing issued by the service for one connection
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSession {
    pub server_ip: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub internal_ip: String,
    pub ports: Ports,
}

// Manual Debug impl so the issued private key never lands in logs
impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("server_ip", &self.server_ip)
            .field("public_key", &self.public_key)
            .field("has_private_key", &self.private_key.is_some())
            .field("internal_ip", &self.internal_ip)
            .field("ports", &self.ports)
            .finish()
    }
}

/// Status of the VPN tunnel as shown to users
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    NotRunning,
    Connecting,
    Connected,
    Disconnecting,
}

impl TunnelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }

    /// Check if the status represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TunnelStatus::Connecting | TunnelStatus::Disconnecting)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TunnelStatus::NotRunning => "not running",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// Interface state reported by the tunnel backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceState {
    Up,
    Down,
}

/// Response of the daemon status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: TunnelStatus,
    #[serde(default)]
    pub server: Option<Server>,
}

/// Login request forwarded by the daemon to the remote service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Events streamed by the daemon over SSE
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusEvent {
    Status {
        status: TunnelStatus,
        #[serde(default)]
        server: Option<Server>,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}
