use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

/// Connection lifecycle. Variants are ordered; a connection only ever moves
/// to a greater state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    Connector,
    Acceptor,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
pub enum TrustZone {
    #[default]
    ExternalClientToServer,
    InternalServerToServer,
}

impl TrustZone {
    pub fn is_external(&self) -> bool {
        matches!(self, Self::ExternalClientToServer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum DisconnectReason {
    UserRequested,
    Timeout,
    RetryLimitExceeded,
    HandshakeTimeout,
    HandshakeRejected,
    ProtocolError,
    VersionMismatch,
    TransportFull,
    TransportError,
    ConnectionClosed,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserRequested => "user requested",
            Self::Timeout => "timed out",
            Self::RetryLimitExceeded => "reliable retry limit exceeded",
            Self::HandshakeTimeout => "handshake timed out",
            Self::HandshakeRejected => "handshake rejected",
            Self::ProtocolError => "protocol error",
            Self::VersionMismatch => "version mismatch",
            Self::TransportFull => "transport full",
            Self::TransportError => "transport error",
            Self::ConnectionClosed => "connection closed",
            Self::Shutdown => "shutting down",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RetryLimitExceeded | Self::HandshakeTimeout
        )
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side is considered to have initiated a termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationEndpoint {
    Local,
    Remote,
}
