use std::io;

use thiserror::Error;

use crate::address::IpAddress;
use crate::config::ProtocolType;
use crate::id::ConnectionId;
use crate::protocol::PacketError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),
    #[error("already connected to {0}")]
    AlreadyConnected(IpAddress),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("{0} transport cannot reach {1}")]
    Unreachable(ProtocolType, IpAddress),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
