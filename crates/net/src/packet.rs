use crate::protocol::PacketError;

/// An outgoing packet produced by the codec layer. The connection never
/// looks inside the payload; it only needs the encoded bytes and a type tag
/// so the receiver can dispatch.
pub trait Packet {
    fn packet_type(&self) -> u16;
    fn encode(&self) -> Result<Vec<u8>, PacketError>;
}

/// Pre-encoded payload with a type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    packet_type: u16,
    payload: Vec<u8>,
}

impl RawPacket {
    pub fn new(packet_type: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }
}

impl Packet for RawPacket {
    fn packet_type(&self) -> u16 {
        self.packet_type
    }

    fn encode(&self) -> Result<Vec<u8>, PacketError> {
        Ok(self.payload.clone())
    }
}

/// A packet delivered by a connection to the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub packet_type: u16,
    pub payload: Vec<u8>,
    pub reliable: bool,
}
