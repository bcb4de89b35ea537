use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::IpAddress;
use crate::error::TransportError;
use crate::protocol::DEFAULT_MTU;
use crate::quality::ConnectionQuality;
use crate::state::TrustZone;

pub const DEFAULT_PORT: u16 = 33450;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProtocolType {
    #[default]
    Udp,
    Tcp,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Udp => "udp",
            ProtocolType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(ProtocolType::Udp),
            "tcp" => Ok(ProtocolType::Tcp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

/// Timing, retry and buffering policy for a single connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub mtu: usize,
    pub timeout: Duration,
    pub handshake_timeout: Duration,
    pub handshake_resend_interval: Duration,
    pub heartbeat_interval: Duration,
    pub disconnect_grace: Duration,
    pub max_reliable_attempts: u32,
    pub max_reliable_in_flight: usize,
    pub reliable_queue_capacity: usize,
    pub reliable_receive_window: usize,
    pub max_stream_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            handshake_resend_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            disconnect_grace: Duration::from_secs(1),
            max_reliable_attempts: 10,
            max_reliable_in_flight: 64,
            reliable_queue_capacity: 256,
            reliable_receive_window: 256,
            max_stream_buffer: 1024 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Rejects settings the reliability layer cannot honor.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_reliable_in_flight == 0 || self.reliable_receive_window == 0 {
            return Err(TransportError::InvalidConfig(
                "reliable window sizes must be non-zero".to_string(),
            ));
        }
        if self.max_reliable_in_flight > self.reliable_receive_window {
            return Err(TransportError::InvalidConfig(format!(
                "max_reliable_in_flight ({}) exceeds reliable_receive_window ({})",
                self.max_reliable_in_flight, self.reliable_receive_window
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub protocol: ProtocolType,
    pub bind_address: IpAddress,
    /// Accept inbound connections.
    pub listen: bool,
    pub max_connections: usize,
    pub trust_zone: TrustZone,
    pub connection: ConnectionConfig,
    /// Applied to every new connection when set.
    pub quality: Option<ConnectionQuality>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolType::Udp,
            bind_address: IpAddress::unspecified(DEFAULT_PORT),
            listen: true,
            max_connections: 32,
            trust_zone: TrustZone::ExternalClientToServer,
            connection: ConnectionConfig::default(),
            quality: None,
        }
    }
}

impl TransportConfig {
    /// Client-side configuration: ephemeral port, no inbound connections.
    pub fn connector(protocol: ProtocolType) -> Self {
        Self {
            protocol,
            bind_address: IpAddress::unspecified(0),
            listen: false,
            ..Default::default()
        }
    }

    pub fn listener(protocol: ProtocolType, bind_address: IpAddress) -> Self {
        Self {
            protocol,
            bind_address,
            listen: true,
            ..Default::default()
        }
    }
}
