use std::time::Instant;

use crate::address::IpAddress;
use crate::id::{ConnectionId, PacketId};
use crate::metrics::ConnectionMetrics;
use crate::packet::{Packet, ReceivedPacket};
use crate::quality::ConnectionQuality;
use crate::state::{
    ConnectionRole, ConnectionState, DisconnectReason, TerminationEndpoint, TrustZone,
};
use crate::transport::ConnectionEvent;

/// Opaque value the session layer attaches to a connection.
///
/// The connection stores and returns it and never interprets it. Whatever the
/// handle refers to (a session slot, an index into a table) is owned and kept
/// alive by the caller, typically in a map keyed by [`ConnectionId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserData(pub u64);

/// A logical, stateful channel to one remote endpoint, independent of the
/// transport underneath.
///
/// Connections are driven by the single thread that owns their transport and
/// are not internally synchronized. No method blocks; sends only queue work
/// for the transport's next update.
pub trait Connection {
    fn connection_id(&self) -> ConnectionId;

    fn remote_address(&self) -> IpAddress;

    /// Rebinds the remote endpoint (NAT rebinding, session migration) without
    /// creating a new logical connection.
    fn set_remote_address(&mut self, address: IpAddress);

    fn connection_state(&self) -> ConnectionState;

    fn connection_role(&self) -> ConnectionRole;

    fn trust_zone(&self) -> TrustZone;

    /// Queues a packet for guaranteed, in-order delivery relative to other
    /// reliable packets on this connection.
    ///
    /// `true` means accepted for transmission, not delivered. Returns `false`
    /// when the connection is not in a sendable state, the packet fails to
    /// encode or exceeds the MTU, or the reliable queue is full. A packet the
    /// transport can never deliver surfaces later as a disconnect with a
    /// timeout-class reason.
    fn send_reliable_packet(&mut self, packet: &dyn Packet) -> bool;

    /// Sends a packet best-effort and returns an id for [`was_packet_acked`].
    /// Returns `None` under the same conditions that make
    /// [`send_reliable_packet`] return `false`.
    ///
    /// [`was_packet_acked`]: Connection::was_packet_acked
    /// [`send_reliable_packet`]: Connection::send_reliable_packet
    fn send_unreliable_packet(&mut self, packet: &dyn Packet) -> Option<PacketId>;

    /// True only when the remote acknowledged this specific unreliable packet.
    /// False for unacknowledged, lost, aged-out or foreign ids.
    fn was_packet_acked(&self, packet_id: PacketId) -> bool;

    /// Starts termination. Returns `true` on the first call from a live state;
    /// every later call returns `false` and changes nothing.
    fn disconnect(&mut self, reason: DisconnectReason, endpoint: TerminationEndpoint) -> bool;

    /// Reason and initiating side, once termination has started.
    fn disconnect_cause(&self) -> Option<(DisconnectReason, TerminationEndpoint)>;

    /// Advisory. A no-op on stream transports.
    fn set_connection_mtu(&mut self, mtu: usize);

    fn connection_mtu(&self) -> usize;

    fn set_user_data(&mut self, user_data: Option<UserData>);

    fn user_data(&self) -> Option<UserData>;

    fn metrics(&self) -> &ConnectionMetrics;

    fn connection_quality(&self) -> &ConnectionQuality;

    /// Debug-only degradation. A no-op on stream transports.
    fn set_connection_quality(&mut self, quality: ConnectionQuality);
}

/// State shared by every transport's connection type.
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    pub id: ConnectionId,
    pub remote_address: IpAddress,
    pub role: ConnectionRole,
    pub trust_zone: TrustZone,
    pub metrics: ConnectionMetrics,
    pub quality: ConnectionQuality,
    pub user_data: Option<UserData>,
    pub mtu: usize,
    state: ConnectionState,
    cause: Option<(DisconnectReason, TerminationEndpoint)>,
    events: Vec<ConnectionEvent>,
}

impl ConnectionCore {
    pub fn new(
        id: ConnectionId,
        remote_address: IpAddress,
        role: ConnectionRole,
        trust_zone: TrustZone,
        mtu: usize,
        now: Instant,
    ) -> Self {
        debug_assert!(id.is_valid());
        Self {
            id,
            remote_address,
            role,
            trust_zone,
            metrics: ConnectionMetrics::new(now),
            quality: ConnectionQuality::default(),
            user_data: None,
            mtu,
            state: ConnectionState::Connecting,
            cause: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cause(&self) -> Option<(DisconnectReason, TerminationEndpoint)> {
        self.cause
    }

    /// Moves forward to `next`. Backward or repeated transitions are ignored.
    fn advance(&mut self, next: ConnectionState) -> bool {
        if next <= self.state {
            return false;
        }

        log::debug!(
            "Connection {} to {}: {:?} -> {:?}",
            self.id,
            self.remote_address,
            self.state,
            next
        );
        self.state = next;

        match next {
            ConnectionState::Connected => {
                log::info!("Connection {} established with {}", self.id, self.remote_address);
                self.events.push(ConnectionEvent::Connected {
                    id: self.id,
                    address: self.remote_address,
                });
            }
            ConnectionState::Disconnected => {
                let (reason, endpoint) = self
                    .cause
                    .unwrap_or((DisconnectReason::ConnectionClosed, TerminationEndpoint::Local));
                self.events.push(ConnectionEvent::Disconnected {
                    id: self.id,
                    reason,
                    endpoint,
                });
            }
            _ => {}
        }

        true
    }

    pub fn mark_connected(&mut self) -> bool {
        self.state == ConnectionState::Connecting && self.advance(ConnectionState::Connected)
    }

    /// Records the cause and enters Disconnecting. False if already closing.
    pub fn begin_disconnect(
        &mut self,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
    ) -> bool {
        if self.state.is_closing() {
            return false;
        }

        log::info!(
            "Connection {} to {} disconnecting: {} ({:?})",
            self.id,
            self.remote_address,
            reason,
            endpoint
        );
        self.cause = Some((reason, endpoint));
        self.advance(ConnectionState::Disconnecting)
    }

    /// Enters the terminal state, recording `reason` unless a cause is
    /// already known.
    pub fn finish_disconnect(
        &mut self,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
    ) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }

        if self.cause.is_none() {
            log::info!(
                "Connection {} to {} closed: {} ({:?})",
                self.id,
                self.remote_address,
                reason,
                endpoint
            );
            self.cause = Some((reason, endpoint));
        }
        self.advance(ConnectionState::Disconnected)
    }

    pub fn deliver(&mut self, packet: ReceivedPacket) {
        self.events.push(ConnectionEvent::Packet {
            id: self.id,
            packet,
        });
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }
}
