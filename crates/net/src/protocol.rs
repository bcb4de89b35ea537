use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::state::DisconnectReason;

pub const DEFAULT_MTU: usize = 1200;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 1472;
pub const MAX_STREAM_FRAME: usize = 64 * 1024;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5445_5448;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct DatagramHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: Option<u32>,
    pub ack_bitfield: u32,
}

impl DatagramHeader {
    pub fn new(sequence: u32, ack: Option<u32>, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }

    /// Every sequence this header acknowledges, newest first.
    pub fn acked_sequences(&self) -> Vec<u32> {
        let Some(ack) = self.ack else {
            return Vec::new();
        };

        let mut acked = vec![ack];
        for diff in 1..=32u32 {
            if self.ack_bitfield & (1 << (diff - 1)) != 0 {
                acked.push(ack.wrapping_sub(diff));
            }
        }
        acked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct PayloadFrame {
    pub reliable_sequence: Option<u32>,
    pub packet_type: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Frame {
    ConnectionRequest { client_salt: u64 },
    ConnectionChallenge { server_salt: u64, challenge: u64 },
    ChallengeResponse { combined_salt: u64 },
    ConnectionAccepted,
    ConnectionDenied { reason: DisconnectReason },
    Payload(PayloadFrame),
    Heartbeat,
    Disconnect { reason: DisconnectReason },
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionRequest { .. } => "ConnectionRequest",
            Self::ConnectionChallenge { .. } => "ConnectionChallenge",
            Self::ChallengeResponse { .. } => "ChallengeResponse",
            Self::ConnectionAccepted => "ConnectionAccepted",
            Self::ConnectionDenied { .. } => "ConnectionDenied",
            Self::Payload(_) => "Payload",
            Self::Heartbeat => "Heartbeat",
            Self::Disconnect { .. } => "Disconnect",
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = aligned_copy(data);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned[..]).map_err(PacketError::Deserialize)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Datagram {
    pub header: DatagramHeader,
    pub frame: Frame,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("invalid protocol header")]
    InvalidHeader,
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

impl Datagram {
    pub fn new(header: DatagramHeader, frame: Frame) -> Self {
        Self { header, frame }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    /// Decodes and validates a datagram, rejecting foreign magic or version.
    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        let aligned = aligned_copy(data);
        let datagram = rkyv::from_bytes::<Self, rancor::Error>(&aligned[..])
            .map_err(PacketError::Deserialize)?;
        if !datagram.header.is_valid() {
            return Err(PacketError::InvalidHeader);
        }
        Ok(datagram)
    }
}

// Received buffers carry no alignment guarantee.
fn aligned_copy(data: &[u8]) -> AlignedVec {
    let mut aligned = AlignedVec::<16>::with_capacity(data.len());
    aligned.extend_from_slice(data);
    aligned
}
