use std::io;
use std::net::UdpSocket;
use std::time::Instant;

use crate::address::IpAddress;
use crate::config::{ProtocolType, TransportConfig};
use crate::connection::Connection;
use crate::error::TransportError;
use crate::id::ConnectionId;
use crate::protocol::{Datagram, DatagramHeader, Frame, MAX_MTU};
use crate::state::{DisconnectReason, TerminationEndpoint};
use crate::transport::{ConnectionEvent, ConnectionSet, Transport};

use super::connection::UdpConnection;

/// Many connections multiplexed over one non-blocking UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    local_address: IpAddress,
    config: TransportConfig,
    connections: ConnectionSet<UdpConnection>,
    recv_buffer: [u8; MAX_MTU],
    events: Vec<ConnectionEvent>,
}

impl UdpTransport {
    pub fn bind(config: TransportConfig) -> Result<Self, TransportError> {
        config.connection.validate()?;
        let socket = UdpSocket::bind(config.bind_address.socket_addr())?;
        socket.set_nonblocking(true)?;

        let local_address = IpAddress::from(socket.local_addr()?);
        log::info!(
            "UDP transport bound to {} (listen: {}, max connections: {})",
            local_address,
            config.listen,
            config.max_connections
        );

        Ok(Self {
            socket,
            local_address,
            connections: ConnectionSet::new(config.max_connections),
            config,
            recv_buffer: [0u8; MAX_MTU],
            events: Vec::new(),
        })
    }

    fn receive(&mut self, now: Instant) -> Result<(), TransportError> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, from)) => {
                    let address = IpAddress::from(from);
                    let decoded = Datagram::deserialize(&self.recv_buffer[..size]);
                    match decoded {
                        Ok(datagram) => match self.connections.get_by_address_mut(&address) {
                            Some(connection) => connection.handle_datagram(datagram, size, now),
                            None => self.handle_unknown(address, datagram, size, now),
                        },
                        Err(e) => match self.connections.get_by_address_mut(&address) {
                            Some(connection) => connection.handle_malformed(&e, now),
                            None => log::trace!("Dropping malformed datagram from {}: {}", address, e),
                        },
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces here on some platforms
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn handle_unknown(&mut self, address: IpAddress, datagram: Datagram, size: usize, now: Instant) {
        let Frame::ConnectionRequest { client_salt } = &datagram.frame else {
            log::trace!(
                "Ignoring {} from unknown address {}",
                datagram.frame.name(),
                address
            );
            return;
        };

        if !self.config.listen {
            return;
        }
        let client_salt = *client_salt;

        if self.connections.is_full() {
            log::warn!("Rejecting {}: connection limit reached", address);
            self.deny(address, DisconnectReason::TransportFull);
            return;
        }

        let trust_zone = self.config.trust_zone;
        let connection_config = self.config.connection.clone();
        let result = self.connections.insert_with(address, |id| {
            UdpConnection::acceptor(id, address, client_salt, trust_zone, &connection_config, now)
        });

        match result {
            Ok(id) => {
                log::info!("Accepted connection {} from {}", id, address);
                let quality = self.config.quality;
                if let Some(connection) = self.connections.get_mut(id) {
                    if let Some(quality) = quality {
                        connection.set_connection_quality(quality);
                    }
                    connection.handle_datagram(datagram, size, now);
                }
            }
            Err(e) => log::warn!("Failed to accept {}: {}", address, e),
        }
    }

    fn deny(&self, address: IpAddress, reason: DisconnectReason) {
        let datagram = Datagram::new(
            DatagramHeader::new(0, None, 0),
            Frame::ConnectionDenied { reason },
        );
        match datagram.serialize() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, address.socket_addr()) {
                    log::debug!("Failed to deny {}: {}", address, e);
                }
            }
            Err(e) => log::warn!("Failed to encode denial: {}", e),
        }
    }

    fn flush(&mut self, now: Instant) {
        for connection in self.connections.iter_mut() {
            let address = connection.remote_address().socket_addr();
            for bytes in connection.take_outbound(now) {
                match self.socket.send_to(&bytes, address) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        log::debug!("Socket buffer full, dropping datagram to {}", address);
                    }
                    Err(e) => {
                        log::warn!(
                            "Send to {} failed for connection {}: {}",
                            address,
                            connection.connection_id(),
                            e
                        );
                        connection.abort(DisconnectReason::TransportError);
                        break;
                    }
                }
            }
        }
    }

    fn collect(&mut self) {
        for connection in self.connections.iter_mut() {
            self.events.extend(connection.drain_events());
        }

        self.connections.reindex();
        for connection in self.connections.take_disconnected() {
            log::debug!("Removed connection {}", connection.connection_id());
        }
    }
}

impl Transport for UdpTransport {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Udp
    }

    fn local_address(&self) -> IpAddress {
        self.local_address
    }

    fn connect(&mut self, address: IpAddress) -> Result<ConnectionId, TransportError> {
        if address.family() != self.local_address.family() {
            return Err(TransportError::Unreachable(ProtocolType::Udp, address));
        }

        let now = Instant::now();
        let trust_zone = self.config.trust_zone;
        let connection_config = self.config.connection.clone();
        let id = self.connections.insert_with(address, |id| {
            UdpConnection::connector(id, address, trust_zone, &connection_config, now)
        })?;

        if let (Some(quality), Some(connection)) = (self.config.quality, self.connections.get_mut(id)) {
            connection.set_connection_quality(quality);
        }

        log::info!("Connecting to {} as {}", address, id);
        Ok(id)
    }

    fn update(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();

        self.receive(now)?;
        for connection in self.connections.iter_mut() {
            connection.update(now);
        }
        self.flush(now);
        self.collect();

        Ok(())
    }

    fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        std::mem::take(&mut self.events)
    }

    fn connection(&self, id: ConnectionId) -> Option<&dyn Connection> {
        self.connections.get(id).map(|c| c as &dyn Connection)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut dyn Connection> {
        self.connections.get_mut(id).map(|c| c as &mut dyn Connection)
    }

    fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.ids()
    }

    fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn shutdown(&mut self) {
        log::info!("Shutting down UDP transport on {}", self.local_address);
        for connection in self.connections.iter_mut() {
            connection.disconnect(DisconnectReason::Shutdown, TerminationEndpoint::Local);
        }
        self.flush(Instant::now());
        for connection in self.connections.iter_mut() {
            connection.complete_teardown();
        }
        self.collect();
    }
}
