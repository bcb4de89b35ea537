use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Instant;

use crate::address::IpAddress;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionCore, UserData};
use crate::id::{ConnectionId, PacketId};
use crate::metrics::{ConnectionMetrics, PacketKind};
use crate::packet::{Packet, ReceivedPacket};
use crate::protocol::{Frame, MAX_STREAM_FRAME, PacketError, PayloadFrame};
use crate::quality::{ConnectionQuality, rand_u64};
use crate::state::{
    ConnectionRole, ConnectionState, DisconnectReason, TerminationEndpoint, TrustZone,
};
use crate::transport::ConnectionEvent;

use super::framing::{FrameReader, encode_frame};

const READ_CHUNK: usize = 4096;

/// Connection over its own byte stream.
///
/// The stream already guarantees ordered delivery, so reliable and
/// unreliable packets are framed the same way. Unreliable packet ids are
/// never acknowledged. MTU and quality simulation do not apply.
#[derive(Debug)]
pub struct TcpConnection<S = TcpStream> {
    core: ConnectionCore,
    config: ConnectionConfig,
    stream: S,
    reader: FrameReader,
    write_buffer: Vec<u8>,
    next_packet_id: u32,
    next_reliable: u32,
    handshake_started: Instant,
    last_send: Instant,
    last_receive: Instant,
    disconnect_deadline: Option<Instant>,
}

impl<S: Read + Write> TcpConnection<S> {
    pub fn connector(
        id: ConnectionId,
        address: IpAddress,
        stream: S,
        trust_zone: TrustZone,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        let mut connection = Self::new(
            id,
            address,
            stream,
            ConnectionRole::Connector,
            trust_zone,
            config,
            now,
        );
        connection.queue(
            Frame::ConnectionRequest {
                client_salt: rand_u64(),
            },
            now,
        );
        connection
    }

    pub fn acceptor(
        id: ConnectionId,
        address: IpAddress,
        stream: S,
        trust_zone: TrustZone,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            address,
            stream,
            ConnectionRole::Acceptor,
            trust_zone,
            config,
            now,
        )
    }

    fn new(
        id: ConnectionId,
        address: IpAddress,
        stream: S,
        role: ConnectionRole,
        trust_zone: TrustZone,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self {
            core: ConnectionCore::new(id, address, role, trust_zone, MAX_STREAM_FRAME, now),
            config: config.clone(),
            stream,
            reader: FrameReader::new(),
            write_buffer: Vec::new(),
            next_packet_id: 0,
            next_reliable: 0,
            handshake_started: now,
            last_send: now,
            last_receive: now,
            disconnect_deadline: None,
        }
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes queued but not yet accepted by the stream.
    pub fn pending_bytes(&self) -> usize {
        self.write_buffer.len()
    }

    /// Reads everything the stream has and handles complete frames.
    pub fn receive(&mut self, now: Instant) {
        if self.core.state() == ConnectionState::Disconnected {
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let mut closed = false;
        let mut failure = None;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    self.reader.push(&chunk[..n]);
                    self.last_receive = now;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // frames that arrived before the stream ended still count
        self.process_frames(now);

        if let Some(e) = failure {
            if self.core.state() != ConnectionState::Disconnected {
                log::warn!("Connection {}: read failed: {}", self.core.id, e);
                self.abort(DisconnectReason::TransportError);
            }
        } else if closed {
            self.write_buffer.clear();
            self.core
                .finish_disconnect(DisconnectReason::ConnectionClosed, TerminationEndpoint::Remote);
        }
    }

    fn process_frames(&mut self, now: Instant) {
        while self.core.state() != ConnectionState::Disconnected {
            match self.reader.next_frame() {
                Ok(Some((frame, size))) => {
                    self.core.metrics.record_datagram_received(size, now);
                    self.handle_frame(frame, now);
                }
                Ok(None) => break,
                Err(e @ PacketError::TooLarge { .. }) => {
                    log::warn!("Connection {}: {}, closing stream", self.core.id, e);
                    self.abort(DisconnectReason::ProtocolError);
                }
                Err(e) => self.protocol_violation(&format!("malformed frame ({})", e), now),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let role = self.core.role;

        match frame {
            Frame::ConnectionRequest { .. } => {
                if role != ConnectionRole::Acceptor {
                    return self.protocol_violation("ConnectionRequest sent to connector", now);
                }
                if self.core.mark_connected() {
                    self.queue(Frame::ConnectionAccepted, now);
                }
            }
            Frame::ConnectionAccepted => {
                if role != ConnectionRole::Connector {
                    return self.protocol_violation("ConnectionAccepted sent to acceptor", now);
                }
                self.core.mark_connected();
            }
            Frame::ConnectionDenied { reason } => {
                if role == ConnectionRole::Connector
                    && self.core.state() == ConnectionState::Connecting
                {
                    self.write_buffer.clear();
                    self.core.finish_disconnect(reason, TerminationEndpoint::Remote);
                }
            }
            Frame::ConnectionChallenge { .. } | Frame::ChallengeResponse { .. } => {
                self.protocol_violation("datagram handshake frame on a stream", now);
            }
            Frame::Payload(payload) => self.handle_payload(payload),
            Frame::Heartbeat => {}
            Frame::Disconnect { reason } => {
                self.write_buffer.clear();
                self.core.finish_disconnect(reason, TerminationEndpoint::Remote);
            }
        }
    }

    fn handle_payload(&mut self, payload: PayloadFrame) {
        // Payload queued by the acceptor ahead of its accept still proves the
        // handshake finished.
        if self.core.role == ConnectionRole::Connector
            && self.core.state() == ConnectionState::Connecting
        {
            self.core.mark_connected();
        }
        if !self.core.state().is_connected() {
            return;
        }

        let reliable = payload.reliable_sequence.is_some();
        let kind = if reliable {
            PacketKind::Reliable
        } else {
            PacketKind::Unreliable
        };
        self.core.metrics.record_packet_received(kind);
        self.core.deliver(ReceivedPacket {
            packet_type: payload.packet_type,
            payload: payload.payload,
            reliable,
        });
    }

    fn protocol_violation(&mut self, what: &str, now: Instant) {
        if self.core.trust_zone.is_external() {
            log::warn!(
                "Connection {} to {}: {}, disconnecting",
                self.core.id,
                self.core.remote_address,
                what
            );
            self.disconnect_at(DisconnectReason::ProtocolError, TerminationEndpoint::Local, now);
        } else {
            log::debug!("Connection {}: ignoring {}", self.core.id, what);
        }
    }

    /// Drives handshake and idle timeouts, heartbeats and teardown.
    pub fn update(&mut self, now: Instant) {
        match self.core.state() {
            ConnectionState::Connecting => {
                if now.saturating_duration_since(self.handshake_started)
                    > self.config.handshake_timeout
                {
                    self.write_buffer.clear();
                    self.core.finish_disconnect(
                        DisconnectReason::HandshakeTimeout,
                        TerminationEndpoint::Local,
                    );
                }
            }
            ConnectionState::Connected => {
                if now.saturating_duration_since(self.last_receive) > self.config.timeout {
                    self.disconnect_at(DisconnectReason::Timeout, TerminationEndpoint::Local, now);
                } else if now.saturating_duration_since(self.last_send)
                    >= self.config.heartbeat_interval
                {
                    self.queue(Frame::Heartbeat, now);
                }
            }
            ConnectionState::Disconnecting => {
                let expired = self.disconnect_deadline.is_none_or(|deadline| now >= deadline);
                if self.write_buffer.is_empty() || expired {
                    self.complete_teardown();
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Writes as much of the outbound buffer as the stream accepts.
    pub fn flush(&mut self) {
        if self.core.state() == ConnectionState::Disconnected {
            return;
        }

        while !self.write_buffer.is_empty() {
            match self.stream.write(&self.write_buffer) {
                Ok(0) => {
                    log::warn!("Connection {}: stream closed for writing", self.core.id);
                    self.abort(DisconnectReason::TransportError);
                    return;
                }
                Ok(n) => {
                    self.write_buffer.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Connection {}: write failed: {}", self.core.id, e);
                    self.abort(DisconnectReason::TransportError);
                    return;
                }
            }
        }

        if let Err(e) = self.stream.flush() {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::debug!("Connection {}: flush failed: {}", self.core.id, e);
            }
        }
    }

    /// Appends a frame to the outbound buffer. Payload frames are refused
    /// once the buffer would grow past its limit; control frames never are.
    fn queue(&mut self, frame: Frame, now: Instant) -> bool {
        let is_payload = matches!(frame, Frame::Payload(_));
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::debug!("Connection {}: failed to frame {}: {}", self.core.id, frame.name(), e);
                return false;
            }
        };

        if is_payload && self.write_buffer.len() + bytes.len() > self.config.max_stream_buffer {
            log::debug!(
                "Connection {}: outbound buffer full ({} bytes)",
                self.core.id,
                self.write_buffer.len()
            );
            return false;
        }

        self.core.metrics.record_datagram_sent(bytes.len(), now);
        self.write_buffer.extend_from_slice(&bytes);
        self.last_send = now;
        true
    }

    fn queue_payload(&mut self, packet: &dyn Packet, reliable_sequence: Option<u32>) -> bool {
        if !self.core.state().can_send() {
            return false;
        }

        let payload = match packet.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Connection {}: packet encoding failed: {}", self.core.id, e);
                return false;
            }
        };
        let frame = Frame::Payload(PayloadFrame {
            reliable_sequence,
            packet_type: packet.packet_type(),
            payload,
        });
        self.queue(frame, Instant::now())
    }

    fn disconnect_at(
        &mut self,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
        now: Instant,
    ) -> bool {
        if !self.core.begin_disconnect(reason, endpoint) {
            return false;
        }

        self.queue(Frame::Disconnect { reason }, now);
        self.disconnect_deadline = Some(now + self.config.disconnect_grace);
        true
    }

    /// Ends the connection without waiting for buffered bytes.
    pub fn complete_teardown(&mut self) {
        self.write_buffer.clear();
        self.core
            .finish_disconnect(DisconnectReason::ConnectionClosed, TerminationEndpoint::Local);
    }

    fn abort(&mut self, reason: DisconnectReason) {
        self.core.begin_disconnect(reason, TerminationEndpoint::Local);
        self.complete_teardown();
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.core.drain_events()
    }
}

impl<S: Read + Write> Connection for TcpConnection<S> {
    fn connection_id(&self) -> ConnectionId {
        self.core.id
    }

    fn remote_address(&self) -> IpAddress {
        self.core.remote_address
    }

    fn set_remote_address(&mut self, address: IpAddress) {
        self.core.remote_address = address;
    }

    fn connection_state(&self) -> ConnectionState {
        self.core.state()
    }

    fn connection_role(&self) -> ConnectionRole {
        self.core.role
    }

    fn trust_zone(&self) -> TrustZone {
        self.core.trust_zone
    }

    fn send_reliable_packet(&mut self, packet: &dyn Packet) -> bool {
        let sequence = self.next_reliable;
        if !self.queue_payload(packet, Some(sequence)) {
            return false;
        }
        self.next_reliable = self.next_reliable.wrapping_add(1);
        self.core.metrics.record_packet_sent(PacketKind::Reliable);
        true
    }

    fn send_unreliable_packet(&mut self, packet: &dyn Packet) -> Option<PacketId> {
        if !self.queue_payload(packet, None) {
            return None;
        }
        let packet_id = PacketId::new(self.next_packet_id);
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        self.core.metrics.record_packet_sent(PacketKind::Unreliable);
        Some(packet_id)
    }

    fn was_packet_acked(&self, _packet_id: PacketId) -> bool {
        false
    }

    fn disconnect(&mut self, reason: DisconnectReason, endpoint: TerminationEndpoint) -> bool {
        self.disconnect_at(reason, endpoint, Instant::now())
    }

    fn disconnect_cause(&self) -> Option<(DisconnectReason, TerminationEndpoint)> {
        self.core.cause()
    }

    fn set_connection_mtu(&mut self, mtu: usize) {
        log::debug!("Connection {}: ignoring MTU {} on a stream", self.core.id, mtu);
    }

    fn connection_mtu(&self) -> usize {
        self.core.mtu
    }

    fn set_user_data(&mut self, user_data: Option<UserData>) {
        self.core.user_data = user_data;
    }

    fn user_data(&self) -> Option<UserData> {
        self.core.user_data
    }

    fn metrics(&self) -> &ConnectionMetrics {
        &self.core.metrics
    }

    fn connection_quality(&self) -> &ConnectionQuality {
        &self.core.quality
    }

    fn set_connection_quality(&mut self, _quality: ConnectionQuality) {
        log::debug!(
            "Connection {}: quality simulation is not supported on streams",
            self.core.id
        );
    }
}
