pub mod address;
pub mod config;
pub mod connection;
pub mod error;
pub mod id;
pub mod metrics;
pub mod packet;
pub mod protocol;
pub mod quality;
pub mod state;
pub mod tcp;
pub mod transport;
pub mod udp;

pub use address::{AddressFamily, IpAddress};
pub use config::{ConnectionConfig, DEFAULT_PORT, ProtocolType, TransportConfig};
pub use connection::{Connection, UserData};
pub use error::TransportError;
pub use id::{ConnectionId, ConnectionIdGenerator, INVALID_CONNECTION_ID, PacketId};
pub use metrics::{ConnectionMetrics, DataRate, PacketKind, RoundTripTime};
pub use packet::{Packet, RawPacket, ReceivedPacket};
pub use protocol::{
    DEFAULT_MTU, Datagram, DatagramHeader, Frame, MAX_MTU, MAX_STREAM_FRAME, MIN_MTU, PacketError,
    PayloadFrame, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use quality::{ConnectionQuality, LatencyQueue};
pub use state::{
    ConnectionRole, ConnectionState, DisconnectReason, TerminationEndpoint, TrustZone,
};
pub use tcp::{TcpConnection, TcpTransport};
pub use transport::{ConnectionEvent, ConnectionSet, Transport, bind};
pub use udp::{UdpConnection, UdpTransport};
