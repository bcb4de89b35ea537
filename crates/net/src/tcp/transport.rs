use std::io::{self, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::Instant;

use crate::address::IpAddress;
use crate::config::{ProtocolType, TransportConfig};
use crate::connection::Connection;
use crate::error::TransportError;
use crate::id::ConnectionId;
use crate::protocol::Frame;
use crate::state::{DisconnectReason, TerminationEndpoint};
use crate::transport::{ConnectionEvent, ConnectionSet, Transport};

use super::connection::TcpConnection;
use super::framing::encode_frame;

/// One non-blocking stream per connection, plus an optional listener.
pub struct TcpTransport {
    listener: Option<TcpListener>,
    local_address: IpAddress,
    config: TransportConfig,
    connections: ConnectionSet<TcpConnection>,
    events: Vec<ConnectionEvent>,
}

fn configure(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)
}

impl TcpTransport {
    pub fn bind(config: TransportConfig) -> Result<Self, TransportError> {
        let (listener, local_address) = if config.listen {
            let listener = TcpListener::bind(config.bind_address.socket_addr())?;
            listener.set_nonblocking(true)?;
            let local_address = IpAddress::from(listener.local_addr()?);
            (Some(listener), local_address)
        } else {
            (None, config.bind_address)
        };

        log::info!(
            "TCP transport on {} (listen: {}, max connections: {})",
            local_address,
            config.listen,
            config.max_connections
        );

        Ok(Self {
            listener,
            local_address,
            connections: ConnectionSet::new(config.max_connections),
            config,
            events: Vec::new(),
        })
    }

    fn accept(&mut self, now: Instant) -> Result<(), TransportError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };

        loop {
            let (stream, from) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let address = IpAddress::from(from);

            if self.connections.is_full() {
                log::warn!("Rejecting {}: connection limit reached", address);
                deny(stream, DisconnectReason::TransportFull);
                continue;
            }
            if let Err(e) = configure(&stream) {
                log::warn!("Failed to configure stream from {}: {}", address, e);
                continue;
            }

            let trust_zone = self.config.trust_zone;
            let connection_config = &self.config.connection;
            match self.connections.insert_with(address, |id| {
                TcpConnection::acceptor(id, address, stream, trust_zone, connection_config, now)
            }) {
                Ok(id) => log::info!("Accepted connection {} from {}", id, address),
                Err(e) => log::warn!("Failed to accept {}: {}", address, e),
            }
        }
        Ok(())
    }

    fn collect(&mut self) {
        for connection in self.connections.iter_mut() {
            self.events.extend(connection.drain_events());
        }

        self.connections.reindex();
        for connection in self.connections.take_disconnected() {
            if let Err(e) = connection.stream().shutdown(Shutdown::Both) {
                log::trace!("Shutdown of {} failed: {}", connection.connection_id(), e);
            }
            log::debug!("Removed connection {}", connection.connection_id());
        }
    }
}

fn deny(mut stream: TcpStream, reason: DisconnectReason) {
    match encode_frame(&Frame::ConnectionDenied { reason }) {
        Ok(bytes) => {
            if let Err(e) = stream.write_all(&bytes) {
                log::debug!("Failed to send denial: {}", e);
            }
        }
        Err(e) => log::warn!("Failed to encode denial: {}", e),
    }
}

impl Transport for TcpTransport {
    fn protocol(&self) -> ProtocolType {
        ProtocolType::Tcp
    }

    fn local_address(&self) -> IpAddress {
        self.local_address
    }

    /// Blocks for at most the handshake timeout while the TCP connection is
    /// established.
    fn connect(&mut self, address: IpAddress) -> Result<ConnectionId, TransportError> {
        if self.connections.id_by_address(&address).is_some() {
            return Err(TransportError::AlreadyConnected(address));
        }
        if self.connections.is_full() {
            return Err(TransportError::ConnectionLimit(self.config.max_connections));
        }

        let stream = TcpStream::connect_timeout(
            &address.socket_addr(),
            self.config.connection.handshake_timeout,
        )?;
        configure(&stream)?;

        let now = Instant::now();
        let trust_zone = self.config.trust_zone;
        let connection_config = &self.config.connection;
        let id = self.connections.insert_with(address, |id| {
            TcpConnection::connector(id, address, stream, trust_zone, connection_config, now)
        })?;

        log::info!("Connecting to {} as {}", address, id);
        Ok(id)
    }

    fn update(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();

        self.accept(now)?;
        for connection in self.connections.iter_mut() {
            connection.receive(now);
            connection.update(now);
            connection.flush();
        }
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
        log::info!("Shutting down TCP transport on {}", self.local_address);

        for connection in self.connections.iter_mut() {
            connection.disconnect(DisconnectReason::Shutdown, TerminationEndpoint::Local);
            connection.flush();
            connection.complete_teardown();
        }
        self.collect();
    }
}
