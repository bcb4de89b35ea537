use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

use tether::{
    Connection, ConnectionEvent, ConnectionId, IpAddress, PacketId, RawPacket, ReceivedPacket,
    Transport, TransportError, UserData,
};

use crate::config::NodeConfig;

pub const PING: u16 = 1;
pub const ECHO: u16 = 2;

const TRACKED_UNRELIABLE: usize = 64;

/// Per-connection session state, reachable from a connection's user data.
#[derive(Debug)]
struct Session {
    id: ConnectionId,
    address: IpAddress,
    pings_sent: u64,
    echoes: u64,
    unreliable: VecDeque<PacketId>,
}

pub struct Node {
    transport: Box<dyn Transport>,
    config: NodeConfig,
    target: Option<IpAddress>,
    sessions: Vec<Option<Session>>,
    started: Instant,
    next_send: Instant,
    next_report: Instant,
    target_closed: bool,
}

impl Node {
    pub fn new(transport: Box<dyn Transport>, config: NodeConfig, target: Option<IpAddress>) -> Self {
        let now = Instant::now();
        Self {
            transport,
            next_report: now + config.report_interval(),
            config,
            target,
            sessions: Vec::new(),
            started: now,
            next_send: now,
            target_closed: false,
        }
    }

    pub fn local_address(&self) -> IpAddress {
        self.transport.local_address()
    }

    pub fn run(&mut self) -> Result<(), TransportError> {
        if let Some(target) = self.target {
            self.transport.connect(target)?;
        }

        let deadline = self.config.duration().map(|d| self.started + d);
        loop {
            self.tick()?;

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                log::info!("Run time elapsed");
                break;
            }
            if self.target_closed {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.report();
        self.transport.shutdown();
        for event in self.transport.drain_events() {
            self.handle_event(event);
        }
        Ok(())
    }

    pub fn tick(&mut self) -> Result<(), TransportError> {
        self.transport.update()?;
        for event in self.transport.drain_events() {
            self.handle_event(event);
        }

        let now = Instant::now();
        if self.target.is_some() && now >= self.next_send {
            self.next_send = now + self.config.send_interval();
            for slot in 0..self.sessions.len() {
                if let Err(e) = self.send_ping(slot) {
                    log::warn!("Ping failed: {}", e);
                }
            }
        }
        if now >= self.next_report {
            self.next_report = now + self.config.report_interval();
            self.report();
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { id, address } => self.open_session(id, address),
            ConnectionEvent::Packet { id, packet } => self.handle_packet(id, packet),
            ConnectionEvent::Disconnected {
                id,
                reason,
                endpoint,
            } => {
                if let Some(slot) = self.sessions.iter_mut().find(|s| s.as_ref().is_some_and(|s| s.id == id)) {
                    if let Some(session) = slot.take() {
                        log::info!(
                            "Session {} with {} ended: {} ({:?}), {} pings, {} echoes",
                            id,
                            session.address,
                            reason,
                            endpoint,
                            session.pings_sent,
                            session.echoes
                        );
                    }
                } else {
                    log::info!("Connection {} closed: {} ({:?})", id, reason, endpoint);
                }
                if self.target.is_some() {
                    self.target_closed = true;
                }
            }
        }
    }

    fn open_session(&mut self, id: ConnectionId, address: IpAddress) {
        let session = Session {
            id,
            address,
            pings_sent: 0,
            echoes: 0,
            unreliable: VecDeque::with_capacity(TRACKED_UNRELIABLE),
        };
        let slot = match self.sessions.iter().position(Option::is_none) {
            Some(slot) => {
                self.sessions[slot] = Some(session);
                slot
            }
            None => {
                self.sessions.push(Some(session));
                self.sessions.len() - 1
            }
        };

        if let Some(connection) = self.transport.connection_mut(id) {
            connection.set_user_data(Some(UserData(slot as u64)));
        }
        log::info!("Session {} opened with {}", id, address);
    }

    fn session_slot(&self, id: ConnectionId) -> Option<usize> {
        let UserData(slot) = self.transport.connection(id)?.user_data()?;
        Some(slot as usize)
    }

    fn handle_packet(&mut self, id: ConnectionId, packet: ReceivedPacket) {
        match packet.packet_type {
            PING => {
                let Some(connection) = self.transport.connection_mut(id) else {
                    return;
                };
                let echo = RawPacket::new(ECHO, packet.payload);
                if packet.reliable {
                    connection.send_reliable_packet(&echo);
                } else {
                    connection.send_unreliable_packet(&echo);
                }
            }
            ECHO => {
                let Some(slot) = self.session_slot(id) else {
                    return;
                };
                if let Some(Some(session)) = self.sessions.get_mut(slot) {
                    session.echoes += 1;
                }
                if let Some(sent_at) = decode_timestamp(&packet.payload) {
                    let elapsed = self.started.elapsed().saturating_sub(sent_at);
                    log::debug!(
                        "Echo from {} after {:.1} ms ({})",
                        id,
                        elapsed.as_secs_f64() * 1000.0,
                        if packet.reliable { "reliable" } else { "unreliable" }
                    );
                }
            }
            other => log::debug!("Ignoring packet type {} from {}", other, id),
        }
    }

    fn send_ping(&mut self, slot: usize) -> Result<(), TransportError> {
        let Some(Some(session)) = self.sessions.get_mut(slot) else {
            return Ok(());
        };
        let connection = self
            .transport
            .connection_mut(session.id)
            .ok_or(TransportError::UnknownConnection(session.id))?;

        let payload = encode_timestamp(self.started.elapsed());
        if connection.send_reliable_packet(&RawPacket::new(PING, payload.clone())) {
            session.pings_sent += 1;
        }
        if let Some(packet_id) = connection.send_unreliable_packet(&RawPacket::new(PING, payload)) {
            session.pings_sent += 1;
            if session.unreliable.len() >= TRACKED_UNRELIABLE {
                session.unreliable.pop_front();
            }
            session.unreliable.push_back(packet_id);
        }
        Ok(())
    }

    fn report(&self) {
        let now = Instant::now();
        for session in self.sessions.iter().flatten() {
            let Some(connection) = self.transport.connection(session.id) else {
                continue;
            };
            let metrics = connection.metrics();
            let rtt = metrics.round_trip_time();
            let acked = session
                .unreliable
                .iter()
                .filter(|id| connection.was_packet_acked(**id))
                .count();

            log::info!(
                "{} {} {:?} up {:.0}s: rtt {:.1} ms (var {:.1}), loss {:.1}%, packets {}/{} out/in, resent {}, {:.0}/{:.0} B/s out/in, unreliable acked {}/{}",
                session.id,
                session.address,
                connection.connection_state(),
                metrics.age().as_secs_f32(),
                rtt.srtt_ms(),
                rtt.rtt_var_ms(),
                metrics.packet_loss_percent(),
                metrics.packets_sent(),
                metrics.packets_received(),
                metrics.packets_resent(),
                metrics.send_rate(now),
                metrics.receive_rate(now),
                acked,
                session.unreliable.len()
            );
        }
    }
}

fn encode_timestamp(elapsed: Duration) -> Vec<u8> {
    (elapsed.as_micros() as u64).to_be_bytes().to_vec()
}

fn decode_timestamp(payload: &[u8]) -> Option<Duration> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(Duration::from_micros(u64::from_be_bytes(bytes)))
}
