use std::time::Instant;

use crate::address::IpAddress;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionCore, UserData};
use crate::id::{ConnectionId, PacketId};
use crate::metrics::{ConnectionMetrics, PacketKind};
use crate::packet::{Packet, ReceivedPacket};
use crate::protocol::{
    Datagram, DatagramHeader, Frame, MAX_MTU, MIN_MTU, PacketError, PayloadFrame,
};
use crate::quality::{ConnectionQuality, LatencyQueue, rand_u64};
use crate::state::{
    ConnectionRole, ConnectionState, DisconnectReason, TerminationEndpoint, TrustZone,
};
use crate::transport::ConnectionEvent;

use super::reliable::{ReliableReceiver, ReliableSender};
use super::tracking::{ReceiveTracker, SentKind, SentWindow};

const DISCONNECT_NOTICE_REPEATS: usize = 3;

/// Connection over a shared UDP socket with its own reliability layer.
///
/// Outgoing datagrams are queued in the connection and collected by the
/// transport with [`take_outbound`](UdpConnection::take_outbound). Reliable
/// packets still queued when a disconnect starts are abandoned at once; only
/// the disconnect notice is flushed, and teardown completes on the first
/// update after it leaves the queue or when the grace period expires.
#[derive(Debug)]
pub struct UdpConnection {
    core: ConnectionCore,
    config: ConnectionConfig,
    send_sequence: u32,
    sent: SentWindow,
    received: ReceiveTracker,
    reliable_out: ReliableSender,
    reliable_in: ReliableReceiver,
    client_salt: u64,
    server_salt: Option<u64>,
    handshake_started: Instant,
    last_handshake_send: Option<Instant>,
    last_send: Instant,
    last_receive: Instant,
    ack_pending: bool,
    disconnect_deadline: Option<Instant>,
    outbound: LatencyQueue<Vec<u8>>,
}

impl UdpConnection {
    pub fn connector(
        id: ConnectionId,
        address: IpAddress,
        trust_zone: TrustZone,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            address,
            ConnectionRole::Connector,
            trust_zone,
            rand_u64(),
            None,
            config,
            now,
        )
    }

    pub fn acceptor(
        id: ConnectionId,
        address: IpAddress,
        client_salt: u64,
        trust_zone: TrustZone,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            address,
            ConnectionRole::Acceptor,
            trust_zone,
            client_salt,
            Some(rand_u64()),
            config,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: ConnectionId,
        address: IpAddress,
        role: ConnectionRole,
        trust_zone: TrustZone,
        client_salt: u64,
        server_salt: Option<u64>,
        config: &ConnectionConfig,
        now: Instant,
    ) -> Self {
        let mtu = config.mtu.clamp(MIN_MTU, MAX_MTU);
        Self {
            core: ConnectionCore::new(id, address, role, trust_zone, mtu, now),
            config: config.clone(),
            send_sequence: 0,
            sent: SentWindow::default(),
            received: ReceiveTracker::new(),
            reliable_out: ReliableSender::new(
                config.reliable_queue_capacity,
                config.max_reliable_in_flight.min(config.reliable_receive_window),
                config.max_reliable_attempts,
            ),
            reliable_in: ReliableReceiver::new(config.reliable_receive_window),
            client_salt,
            server_salt,
            handshake_started: now,
            last_handshake_send: None,
            last_send: now,
            last_receive: now,
            ack_pending: false,
            disconnect_deadline: None,
            outbound: LatencyQueue::new(),
        }
    }

    fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt.unwrap_or_default()
    }

    /// Processes one decoded datagram from the remote endpoint.
    pub fn handle_datagram(&mut self, datagram: Datagram, size: usize, now: Instant) {
        if self.core.state() == ConnectionState::Disconnected {
            return;
        }

        self.core.metrics.record_datagram_received(size, now);
        self.last_receive = now;

        if !self.received.record_received(datagram.header.sequence) {
            return;
        }

        for sequence in datagram.header.acked_sequences() {
            if let Some((kind, rtt)) = self.sent.acknowledge(sequence, now) {
                self.core.metrics.record_acked(rtt);
                if let SentKind::Reliable(reliable_sequence) = kind {
                    self.reliable_out.acknowledge(reliable_sequence);
                }
            }
        }

        if !matches!(datagram.frame, Frame::Heartbeat) {
            self.ack_pending = true;
        }

        self.handle_frame(datagram.frame, now);
    }

    /// Bytes from this connection's address that failed to decode.
    pub fn handle_malformed(&mut self, error: &PacketError, now: Instant) {
        if matches!(error, PacketError::InvalidHeader) && self.core.trust_zone.is_external() {
            log::warn!(
                "Connection {}: {} speaks another protocol version",
                self.core.id,
                self.core.remote_address
            );
            self.disconnect_at(DisconnectReason::VersionMismatch, TerminationEndpoint::Local, now);
            return;
        }
        self.protocol_violation(&format!("malformed datagram ({})", error), now);
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        let role = self.core.role;
        let state = self.core.state();

        match frame {
            Frame::ConnectionRequest { client_salt } => {
                if role != ConnectionRole::Acceptor {
                    return self.protocol_violation("ConnectionRequest sent to connector", now);
                }
                if state == ConnectionState::Connecting && client_salt == self.client_salt {
                    let server_salt = self.server_salt.unwrap_or_default();
                    self.send_control(
                        Frame::ConnectionChallenge {
                            server_salt,
                            challenge: self.combined_salt(),
                        },
                        now,
                    );
                }
            }
            Frame::ConnectionChallenge {
                server_salt,
                challenge,
            } => {
                if role != ConnectionRole::Connector {
                    return self.protocol_violation("ConnectionChallenge sent to acceptor", now);
                }
                if state != ConnectionState::Connecting {
                    return;
                }
                if challenge != self.client_salt ^ server_salt {
                    log::warn!(
                        "Connection {}: invalid challenge from {}",
                        self.core.id,
                        self.core.remote_address
                    );
                    self.core
                        .finish_disconnect(DisconnectReason::HandshakeRejected, TerminationEndpoint::Local);
                    return;
                }
                self.server_salt = Some(server_salt);
                self.send_control(
                    Frame::ChallengeResponse {
                        combined_salt: challenge,
                    },
                    now,
                );
                self.last_handshake_send = Some(now);
            }
            Frame::ChallengeResponse { combined_salt } => {
                if role != ConnectionRole::Acceptor {
                    return self.protocol_violation("ChallengeResponse sent to connector", now);
                }
                if !state.can_send() {
                    return;
                }
                if combined_salt != self.combined_salt() {
                    log::warn!(
                        "Connection {}: invalid challenge response from {}",
                        self.core.id,
                        self.core.remote_address
                    );
                    if state == ConnectionState::Connecting {
                        self.core.finish_disconnect(
                            DisconnectReason::HandshakeRejected,
                            TerminationEndpoint::Local,
                        );
                    }
                    return;
                }
                self.core.mark_connected();
                // repeated for every response in case an earlier accept was lost
                self.send_control(Frame::ConnectionAccepted, now);
            }
            Frame::ConnectionAccepted => {
                if role != ConnectionRole::Connector {
                    return self.protocol_violation("ConnectionAccepted sent to acceptor", now);
                }
                if self.server_salt.is_some() {
                    self.core.mark_connected();
                }
            }
            Frame::ConnectionDenied { reason } => {
                if role == ConnectionRole::Connector && state == ConnectionState::Connecting {
                    self.core.finish_disconnect(reason, TerminationEndpoint::Remote);
                }
            }
            Frame::Payload(payload) => self.handle_payload(payload),
            Frame::Heartbeat => {}
            Frame::Disconnect { reason } => {
                self.reliable_out.clear();
                self.core.finish_disconnect(reason, TerminationEndpoint::Remote);
            }
        }
    }

    fn handle_payload(&mut self, payload: PayloadFrame) {
        // The accept may have been lost; data after the challenge proves the
        // acceptor finished its side.
        if self.core.role == ConnectionRole::Connector
            && self.core.state() == ConnectionState::Connecting
            && self.server_salt.is_some()
        {
            self.core.mark_connected();
        }

        if !self.core.state().is_connected() {
            log::trace!(
                "Connection {}: dropping payload in state {:?}",
                self.core.id,
                self.core.state()
            );
            return;
        }

        match payload.reliable_sequence {
            None => {
                self.core.metrics.record_packet_received(PacketKind::Unreliable);
                self.core.deliver(ReceivedPacket {
                    packet_type: payload.packet_type,
                    payload: payload.payload,
                    reliable: false,
                });
            }
            Some(sequence) => {
                let ready = self
                    .reliable_in
                    .receive(sequence, payload.packet_type, payload.payload);
                for (packet_type, payload) in ready {
                    self.core.metrics.record_packet_received(PacketKind::Reliable);
                    self.core.deliver(ReceivedPacket {
                        packet_type,
                        payload,
                        reliable: true,
                    });
                }
            }
        }
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

    /// Drives handshake retries, reliable retransmission, heartbeats,
    /// timeouts and teardown.
    pub fn update(&mut self, now: Instant) {
        match self.core.state() {
            ConnectionState::Connecting => self.update_handshake(now),
            ConnectionState::Connected => self.update_connected(now),
            ConnectionState::Disconnecting => {
                let expired = self.disconnect_deadline.is_none_or(|deadline| now >= deadline);
                if self.outbound.is_empty() || expired {
                    self.complete_teardown();
                }
            }
            ConnectionState::Disconnected => {}
        }
    }

    fn update_handshake(&mut self, now: Instant) {
        if now.saturating_duration_since(self.handshake_started) > self.config.handshake_timeout {
            self.core
                .finish_disconnect(DisconnectReason::HandshakeTimeout, TerminationEndpoint::Local);
            return;
        }

        if self.core.role != ConnectionRole::Connector {
            return;
        }

        let due = self.last_handshake_send.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.handshake_resend_interval
        });
        if due {
            let frame = match self.server_salt {
                None => Frame::ConnectionRequest {
                    client_salt: self.client_salt,
                },
                Some(_) => Frame::ChallengeResponse {
                    combined_salt: self.combined_salt(),
                },
            };
            self.send_control(frame, now);
            self.last_handshake_send = Some(now);
        }
    }

    fn update_connected(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_receive) > self.config.timeout {
            self.disconnect_at(DisconnectReason::Timeout, TerminationEndpoint::Local, now);
            return;
        }

        let rto = self.core.metrics.round_trip_time().rto();
        match self.reliable_out.poll(now, rto) {
            Ok(due) => {
                for message in due {
                    if message.retransmit {
                        self.core.metrics.record_resent();
                    }
                    let frame = Frame::Payload(PayloadFrame {
                        reliable_sequence: Some(message.sequence),
                        packet_type: message.packet_type,
                        payload: message.payload,
                    });
                    self.emit(frame, SentKind::Reliable(message.sequence), now);
                }
            }
            Err(exhausted) => {
                log::warn!(
                    "Connection {}: reliable packet {} unacknowledged after {} attempts",
                    self.core.id,
                    exhausted.sequence,
                    exhausted.attempts
                );
                self.disconnect_at(
                    DisconnectReason::RetryLimitExceeded,
                    TerminationEndpoint::Local,
                    now,
                );
                return;
            }
        }

        let idle = now.saturating_duration_since(self.last_send) >= self.config.heartbeat_interval;
        if self.ack_pending || idle {
            self.send_control(Frame::Heartbeat, now);
        }
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

        self.reliable_out.clear();
        for _ in 0..DISCONNECT_NOTICE_REPEATS {
            self.send_control(Frame::Disconnect { reason }, now);
        }
        self.disconnect_deadline = Some(now + self.config.disconnect_grace);
        true
    }

    /// Ends the connection without waiting for queued datagrams.
    pub fn complete_teardown(&mut self) {
        self.reliable_out.clear();
        self.outbound.clear();
        self.core
            .finish_disconnect(DisconnectReason::ConnectionClosed, TerminationEndpoint::Local);
    }

    /// Aborts after a socket failure.
    pub(crate) fn abort(&mut self, reason: DisconnectReason) {
        self.core.begin_disconnect(reason, TerminationEndpoint::Local);
        self.complete_teardown();
    }

    fn send_control(&mut self, frame: Frame, now: Instant) {
        self.emit(frame, SentKind::Control, now);
    }

    /// Stamps, encodes and queues one datagram. Nothing is consumed when the
    /// datagram fails to encode or exceeds the MTU.
    fn emit(&mut self, frame: Frame, kind: SentKind, now: Instant) -> Option<PacketId> {
        let sequence = self.send_sequence;
        let (ack, ack_bitfield) = self.received.ack_data();
        let datagram = Datagram::new(DatagramHeader::new(sequence, ack, ack_bitfield), frame);

        let bytes = match datagram.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Connection {}: failed to encode datagram: {}", self.core.id, e);
                return None;
            }
        };
        if bytes.len() > self.core.mtu {
            log::debug!(
                "Connection {}: {} byte datagram exceeds MTU of {}",
                self.core.id,
                bytes.len(),
                self.core.mtu
            );
            return None;
        }

        self.send_sequence = self.send_sequence.wrapping_add(1);
        self.sent.insert(sequence, kind, now);
        self.core.metrics.record_datagram_sent(bytes.len(), now);
        self.last_send = now;
        self.ack_pending = false;

        if self.core.quality.should_drop() {
            self.core.metrics.record_lost();
        } else {
            let release_time = now + self.core.quality.sample_delay();
            self.outbound.push(bytes, release_time);
        }

        Some(PacketId::new(sequence))
    }

    fn fits_mtu(&self, payload: &PayloadFrame) -> bool {
        let probe = Datagram::new(
            DatagramHeader::new(0, Some(0), 0),
            Frame::Payload(payload.clone()),
        );
        probe.serialize().is_ok_and(|bytes| bytes.len() <= self.core.mtu)
    }

    /// Datagrams whose (simulated) release time has come.
    pub fn take_outbound(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.outbound.take_ready(now)
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn pending_reliable(&self) -> usize {
        self.reliable_out.len()
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.core.drain_events()
    }
}

impl Connection for UdpConnection {
    fn connection_id(&self) -> ConnectionId {
        self.core.id
    }

    fn remote_address(&self) -> IpAddress {
        self.core.remote_address
    }

    fn set_remote_address(&mut self, address: IpAddress) {
        if address != self.core.remote_address {
            log::info!(
                "Connection {} rebound from {} to {}",
                self.core.id,
                self.core.remote_address,
                address
            );
            self.core.remote_address = address;
        }
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
        let frame = PayloadFrame {
            reliable_sequence: Some(0),
            packet_type: packet.packet_type(),
            payload,
        };
        if !self.fits_mtu(&frame) {
            return false;
        }

        if self.reliable_out.push(frame.packet_type, frame.payload).is_none() {
            log::debug!("Connection {}: reliable queue full", self.core.id);
            return false;
        }
        self.core.metrics.record_packet_sent(PacketKind::Reliable);
        true
    }

    fn send_unreliable_packet(&mut self, packet: &dyn Packet) -> Option<PacketId> {
        if !self.core.state().can_send() {
            return None;
        }

        let payload = match packet.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("Connection {}: packet encoding failed: {}", self.core.id, e);
                return None;
            }
        };
        let frame = Frame::Payload(PayloadFrame {
            reliable_sequence: None,
            packet_type: packet.packet_type(),
            payload,
        });

        let packet_id = self.emit(frame, SentKind::Unreliable, Instant::now())?;
        self.core.metrics.record_packet_sent(PacketKind::Unreliable);
        Some(packet_id)
    }

    fn was_packet_acked(&self, packet_id: PacketId) -> bool {
        self.sent
            .get(packet_id.value())
            .is_some_and(|record| record.kind == SentKind::Unreliable && record.acked)
    }

    fn disconnect(&mut self, reason: DisconnectReason, endpoint: TerminationEndpoint) -> bool {
        self.disconnect_at(reason, endpoint, Instant::now())
    }

    fn disconnect_cause(&self) -> Option<(DisconnectReason, TerminationEndpoint)> {
        self.core.cause()
    }

    fn set_connection_mtu(&mut self, mtu: usize) {
        self.core.mtu = mtu.clamp(MIN_MTU, MAX_MTU);
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

    fn set_connection_quality(&mut self, quality: ConnectionQuality) {
        log::debug!("Connection {}: simulating {:?}", self.core.id, quality);
        self.core.quality = quality;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::metrics::MAX_RTO;
    use crate::packet::RawPacket;

    fn address(port: u16) -> IpAddress {
        IpAddress::v4(127, 0, 0, 1, port)
    }

    fn pump(from: &mut UdpConnection, to: &mut UdpConnection, now: Instant) -> usize {
        let datagrams = from.take_outbound(now);
        for bytes in &datagrams {
            let datagram = Datagram::deserialize(bytes).unwrap();
            to.handle_datagram(datagram, bytes.len(), now);
        }
        datagrams.len()
    }

    fn connected_pair(
        config: &ConnectionConfig,
        trust_zone: TrustZone,
        now: Instant,
    ) -> (UdpConnection, UdpConnection) {
        let mut a = UdpConnection::connector(ConnectionId::new(1), address(2000), trust_zone, config, now);
        a.update(now);

        let request = a.take_outbound(now);
        assert_eq!(request.len(), 1);
        let datagram = Datagram::deserialize(&request[0]).unwrap();
        let Frame::ConnectionRequest { client_salt } = &datagram.frame else {
            panic!("expected a connection request, got {}", datagram.frame.name());
        };

        let mut b = UdpConnection::acceptor(
            ConnectionId::new(2),
            address(1000),
            *client_salt,
            trust_zone,
            config,
            now,
        );
        b.handle_datagram(datagram, request[0].len(), now);

        pump(&mut b, &mut a, now);
        pump(&mut a, &mut b, now);
        pump(&mut b, &mut a, now);
        (a, b)
    }

    fn packets(events: Vec<ConnectionEvent>) -> Vec<ReceivedPacket> {
        events
            .into_iter()
            .filter_map(|event| match event {
                ConnectionEvent::Packet { packet, .. } => Some(packet),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_connects_both_sides() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);

        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert_eq!(a.connection_role(), ConnectionRole::Connector);
        assert_eq!(b.connection_role(), ConnectionRole::Acceptor);
        assert!(matches!(a.drain_events()[..], [ConnectionEvent::Connected { .. }]));
        assert!(matches!(b.drain_events()[..], [ConnectionEvent::Connected { .. }]));
    }

    #[test]
    fn test_handshake_timeout() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let mut a = UdpConnection::connector(ConnectionId::new(1), address(2000), TrustZone::default(), &config, now);

        a.update(now);
        a.update(now + config.handshake_timeout + Duration::from_millis(1));

        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            a.disconnect_cause(),
            Some((DisconnectReason::HandshakeTimeout, TerminationEndpoint::Local))
        );
        assert!(matches!(
            a.drain_events()[..],
            [ConnectionEvent::Disconnected {
                reason: DisconnectReason::HandshakeTimeout,
                ..
            }]
        ));
    }

    #[test]
    fn test_handshake_request_resent() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let mut a = UdpConnection::connector(ConnectionId::new(1), address(2000), TrustZone::default(), &config, now);

        a.update(now);
        a.update(now + Duration::from_millis(10));
        assert_eq!(a.take_outbound(now).len(), 1);

        a.update(now + config.handshake_resend_interval);
        assert_eq!(a.take_outbound(now + config.handshake_resend_interval).len(), 1);
    }

    #[test]
    fn test_reliable_waits_for_connection() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let mut a = UdpConnection::connector(ConnectionId::new(1), address(2000), TrustZone::default(), &config, now);

        assert!(a.send_reliable_packet(&RawPacket::new(1, vec![1, 2, 3])));
        assert_eq!(a.pending_reliable(), 1);
        assert_eq!(a.metrics().reliable_packets_sent(), 1);

        a.update(now);
        let sent = a.take_outbound(now);
        assert_eq!(sent.len(), 1);
        let datagram = Datagram::deserialize(&sent[0]).unwrap();
        assert!(matches!(datagram.frame, Frame::ConnectionRequest { .. }));
    }

    #[test]
    fn test_reliable_delivery_survives_loss() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let (mut a, mut b) = connected_pair(&config, TrustZone::default(), now);
        b.drain_events();

        for i in 0..3u8 {
            assert!(a.send_reliable_packet(&RawPacket::new(7, vec![i])));
        }
        a.update(now);
        // first transmission lost
        a.take_outbound(now);

        let later = now + MAX_RTO;
        a.update(later);
        pump(&mut a, &mut b, later);

        let received = packets(b.drain_events());
        let payloads: Vec<Vec<u8>> = received.iter().map(|p| p.payload.clone()).collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
        assert!(received.iter().all(|p| p.reliable && p.packet_type == 7));
        assert_eq!(a.metrics().packets_resent(), 3);

        b.update(later);
        pump(&mut b, &mut a, later);
        assert_eq!(a.pending_reliable(), 0);
    }

    #[test]
    fn test_duplicate_datagram_ignored() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);
        b.drain_events();

        a.send_unreliable_packet(&RawPacket::new(3, vec![9])).unwrap();
        let now = Instant::now();
        let sent = a.take_outbound(now);
        for _ in 0..2 {
            let datagram = Datagram::deserialize(&sent[0]).unwrap();
            b.handle_datagram(datagram, sent[0].len(), now);
        }

        assert_eq!(packets(b.drain_events()).len(), 1);
        assert_eq!(b.metrics().unreliable_packets_received(), 1);
    }

    #[test]
    fn test_unreliable_ack_tracking() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);

        let packet_id = a.send_unreliable_packet(&RawPacket::new(3, vec![1])).unwrap();
        assert!(!a.was_packet_acked(packet_id));

        let now = Instant::now();
        pump(&mut a, &mut b, now);
        b.update(now);
        pump(&mut b, &mut a, now);

        assert!(a.was_packet_acked(packet_id));
        assert!(!a.was_packet_acked(PacketId::new(packet_id.value() + 500)));
    }

    #[test]
    fn test_control_datagrams_are_not_packet_ids() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);

        // sequence 0 carried the connection request, which b acknowledged
        b.update(now);
        pump(&mut b, &mut a, now);
        assert!(!a.was_packet_acked(PacketId::new(0)));
    }

    #[test]
    fn test_disconnect_notifies_remote() {
        let now = Instant::now();
        let (mut a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);
        a.drain_events();
        b.drain_events();

        assert!(a.disconnect(DisconnectReason::UserRequested, TerminationEndpoint::Local));
        assert!(!a.disconnect(DisconnectReason::Timeout, TerminationEndpoint::Remote));
        assert_eq!(a.connection_state(), ConnectionState::Disconnecting);
        assert!(!a.send_reliable_packet(&RawPacket::new(1, vec![])));
        assert!(a.send_unreliable_packet(&RawPacket::new(1, vec![])).is_none());

        let now = Instant::now();
        a.update(now);
        assert_eq!(a.connection_state(), ConnectionState::Disconnecting);

        assert_eq!(pump(&mut a, &mut b, now), 3);
        assert_eq!(b.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            b.disconnect_cause(),
            Some((DisconnectReason::UserRequested, TerminationEndpoint::Remote))
        );

        a.update(now);
        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            a.disconnect_cause(),
            Some((DisconnectReason::UserRequested, TerminationEndpoint::Local))
        );
        assert!(matches!(a.drain_events()[..], [ConnectionEvent::Disconnected { .. }]));
        assert!(matches!(b.drain_events()[..], [ConnectionEvent::Disconnected { .. }]));
    }

    #[test]
    fn test_disconnect_abandons_reliable_queue() {
        let now = Instant::now();
        let (mut a, _b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);

        for _ in 0..10 {
            assert!(a.send_reliable_packet(&RawPacket::new(1, vec![0; 16])));
        }
        assert!(a.disconnect(DisconnectReason::UserRequested, TerminationEndpoint::Local));
        assert_eq!(a.pending_reliable(), 0);
    }

    #[test]
    fn test_disconnect_grace_period() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let (mut a, _b) = connected_pair(&config, TrustZone::default(), now);
        a.set_connection_quality(ConnectionQuality::new(0, Duration::from_secs(30), Duration::ZERO));

        assert!(a.disconnect(DisconnectReason::UserRequested, TerminationEndpoint::Local));
        let now = Instant::now();
        a.update(now);
        assert_eq!(a.connection_state(), ConnectionState::Disconnecting);

        a.update(now + config.disconnect_grace);
        assert_eq!(a.connection_state(), ConnectionState::Disconnected);
        assert!(!a.has_outbound());
    }

    #[test]
    fn test_idle_timeout() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let (mut a, _b) = connected_pair(&config, TrustZone::default(), now);

        a.update(now + config.timeout + Duration::from_millis(1));

        assert_eq!(a.connection_state(), ConnectionState::Disconnecting);
        let (reason, endpoint) = a.disconnect_cause().unwrap();
        assert!(reason.is_timeout());
        assert_eq!(endpoint, TerminationEndpoint::Local);
    }

    #[test]
    fn test_reliable_order_survives_stalled_head() {
        let start = Instant::now();
        let config = ConnectionConfig {
            reliable_queue_capacity: 512,
            ..Default::default()
        };
        let (mut a, mut b) = connected_pair(&config, TrustZone::default(), start);
        b.drain_events();

        for i in 0..400u16 {
            assert!(a.send_reliable_packet(&RawPacket::new(3, i.to_be_bytes().to_vec())));
        }

        // every copy of the first reliable message is lost for a second
        let stall_until = start + Duration::from_secs(1);
        let mut now = start;
        let mut delivered = Vec::new();
        for _ in 0..2000 {
            now += Duration::from_millis(10);
            a.update(now);
            for bytes in a.take_outbound(now) {
                let datagram = Datagram::deserialize(&bytes).unwrap();
                let head = matches!(
                    &datagram.frame,
                    Frame::Payload(PayloadFrame {
                        reliable_sequence: Some(0),
                        ..
                    })
                );
                if head && now < stall_until {
                    continue;
                }
                b.handle_datagram(datagram, bytes.len(), now);
            }
            b.update(now);
            pump(&mut b, &mut a, now);
            delivered.extend(packets(b.drain_events()));
            if delivered.len() == 400 && a.pending_reliable() == 0 {
                break;
            }
        }

        let order: Vec<u16> = delivered
            .iter()
            .map(|p| u16::from_be_bytes([p.payload[0], p.payload[1]]))
            .collect();
        assert_eq!(order, (0..400).collect::<Vec<u16>>());
        assert_eq!(a.pending_reliable(), 0);
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn test_retry_limit_disconnects() {
        let mut now = Instant::now();
        let config = ConnectionConfig {
            max_reliable_attempts: 3,
            timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (mut a, _b) = connected_pair(&config, TrustZone::default(), now);

        assert!(a.send_reliable_packet(&RawPacket::new(1, vec![1])));
        for _ in 0..10 {
            a.update(now);
            a.take_outbound(now);
            if a.connection_state() != ConnectionState::Connected {
                break;
            }
            now += MAX_RTO;
        }

        assert_eq!(
            a.disconnect_cause(),
            Some((DisconnectReason::RetryLimitExceeded, TerminationEndpoint::Local))
        );
        assert!(a.metrics().packets_resent() >= 2);
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let (mut a, _b) = connected_pair(&config, TrustZone::default(), now);

        let later = now + config.heartbeat_interval;
        a.update(later);
        let sent = a.take_outbound(later);
        assert_eq!(sent.len(), 1);
        assert_eq!(Datagram::deserialize(&sent[0]).unwrap().frame, Frame::Heartbeat);
    }

    #[test]
    fn test_unexpected_frame_from_external_peer() {
        let now = Instant::now();
        let (_a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::ExternalClientToServer, now);

        let bogus = Datagram::new(DatagramHeader::new(500, None, 0), Frame::ConnectionAccepted);
        b.handle_datagram(bogus, 32, now);

        assert_eq!(
            b.disconnect_cause(),
            Some((DisconnectReason::ProtocolError, TerminationEndpoint::Local))
        );
    }

    #[test]
    fn test_unexpected_frame_from_internal_peer() {
        let now = Instant::now();
        let (_a, mut b) = connected_pair(&ConnectionConfig::default(), TrustZone::InternalServerToServer, now);

        let bogus = Datagram::new(DatagramHeader::new(500, None, 0), Frame::ConnectionAccepted);
        b.handle_datagram(bogus, 32, now);

        assert_eq!(b.connection_state(), ConnectionState::Connected);
        assert_eq!(b.disconnect_cause(), None);
    }

    #[test]
    fn test_mtu_limits_payload() {
        let now = Instant::now();
        let (mut a, _b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);

        a.set_connection_mtu(10);
        assert_eq!(a.connection_mtu(), MIN_MTU);

        let oversized = RawPacket::new(1, vec![0; MIN_MTU]);
        assert!(!a.send_reliable_packet(&oversized));
        assert!(a.send_unreliable_packet(&oversized).is_none());
        assert_eq!(a.metrics().packets_sent(), 0);

        let small = RawPacket::new(1, vec![0; 64]);
        assert!(a.send_unreliable_packet(&small).is_some());
    }

    #[test]
    fn test_simulated_loss() {
        let now = Instant::now();
        let (mut a, _b) = connected_pair(&ConnectionConfig::default(), TrustZone::default(), now);
        a.set_connection_quality(ConnectionQuality::new(100, Duration::ZERO, Duration::ZERO));

        assert!(a.send_unreliable_packet(&RawPacket::new(1, vec![1])).is_some());
        assert!(!a.has_outbound());
        assert_eq!(a.metrics().packets_lost(), 1);
    }

    #[test]
    fn test_user_data_round_trip() {
        let now = Instant::now();
        let config = ConnectionConfig::default();
        let mut a = UdpConnection::connector(ConnectionId::new(1), address(2000), TrustZone::default(), &config, now);

        assert_eq!(a.user_data(), None);
        a.set_user_data(Some(UserData(77)));
        assert_eq!(a.user_data(), Some(UserData(77)));
        a.set_user_data(None);
        assert_eq!(a.user_data(), None);
    }
}
