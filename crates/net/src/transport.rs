use std::collections::HashMap;

use crate::address::IpAddress;
use crate::config::{ProtocolType, TransportConfig};
use crate::connection::Connection;
use crate::error::TransportError;
use crate::id::{ConnectionId, ConnectionIdGenerator};
use crate::packet::ReceivedPacket;
use crate::state::{ConnectionState, DisconnectReason, TerminationEndpoint};
use crate::tcp::TcpTransport;
use crate::udp::UdpTransport;

/// What a transport reports to the layer above after an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        id: ConnectionId,
        address: IpAddress,
    },
    Packet {
        id: ConnectionId,
        packet: ReceivedPacket,
    },
    /// Emitted exactly once per connection, when it reaches its terminal
    /// state.
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
        endpoint: TerminationEndpoint,
    },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::Connected { id, .. } | Self::Packet { id, .. } | Self::Disconnected { id, .. } => *id,
        }
    }
}

/// Owns the sockets and the connections running over them.
///
/// All I/O happens in [`update`](Transport::update), which never blocks.
/// Connections that reach `Disconnected` are removed at the end of the update
/// that emitted their `Disconnected` event.
pub trait Transport {
    fn protocol(&self) -> ProtocolType;

    fn local_address(&self) -> IpAddress;

    /// Opens an outgoing connection. It starts in `Connecting`; a
    /// `Connected` event follows once the handshake completes.
    fn connect(&mut self, address: IpAddress) -> Result<ConnectionId, TransportError>;

    fn update(&mut self) -> Result<(), TransportError>;

    fn drain_events(&mut self) -> Vec<ConnectionEvent>;

    fn connection(&self, id: ConnectionId) -> Option<&dyn Connection>;

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut dyn Connection>;

    fn connection_ids(&self) -> Vec<ConnectionId>;

    fn connection_count(&self) -> usize;

    fn disconnect(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        self.connection_mut(id)
            .is_some_and(|connection| connection.disconnect(reason, TerminationEndpoint::Local))
    }

    /// Notifies every peer and drops all connections.
    fn shutdown(&mut self);
}

/// Opens the transport named by `config.protocol`.
pub fn bind(config: TransportConfig) -> Result<Box<dyn Transport>, TransportError> {
    Ok(match config.protocol {
        ProtocolType::Udp => Box::new(UdpTransport::bind(config)?),
        ProtocolType::Tcp => Box::new(TcpTransport::bind(config)?),
    })
}

/// Connections indexed by id and by remote address.
#[derive(Debug)]
pub struct ConnectionSet<C> {
    connections: HashMap<ConnectionId, C>,
    by_address: HashMap<IpAddress, ConnectionId>,
    ids: ConnectionIdGenerator,
    max_connections: usize,
}

impl<C: Connection> ConnectionSet<C> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            by_address: HashMap::new(),
            ids: ConnectionIdGenerator::new(),
            max_connections,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Allocates an id not held by any live connection and inserts the
    /// connection `create` builds for it.
    pub fn insert_with(
        &mut self,
        address: IpAddress,
        create: impl FnOnce(ConnectionId) -> C,
    ) -> Result<ConnectionId, TransportError> {
        if self.by_address.contains_key(&address) {
            return Err(TransportError::AlreadyConnected(address));
        }
        if self.is_full() {
            return Err(TransportError::ConnectionLimit(self.max_connections));
        }

        let id = loop {
            let id = self.ids.next_id();
            if !self.connections.contains_key(&id) {
                break id;
            }
        };

        self.connections.insert(id, create(id));
        self.by_address.insert(address, id);
        Ok(id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&C> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut C> {
        self.connections.get_mut(&id)
    }

    pub fn id_by_address(&self, address: &IpAddress) -> Option<ConnectionId> {
        self.by_address.get(address).copied()
    }

    pub fn get_by_address_mut(&mut self, address: &IpAddress) -> Option<&mut C> {
        let id = self.by_address.get(address)?;
        self.connections.get_mut(id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut C> {
        self.connections.values_mut()
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<C> {
        let connection = self.connections.remove(&id)?;
        let address = connection.remote_address();
        if self.by_address.get(&address) == Some(&id) {
            self.by_address.remove(&address);
        }
        Some(connection)
    }

    /// Rebuilds the address index after connections changed their remote
    /// address. When two connections end up on one address the one already
    /// indexed there keeps it, and the other is unroutable until it leaves.
    pub fn reindex(&mut self) {
        let stale = self.by_address.iter().any(|(address, id)| {
            self.connections
                .get(id)
                .is_none_or(|c| c.remote_address() != *address)
        }) || self
            .connections
            .values()
            .any(|c| !self.by_address.contains_key(&c.remote_address()));
        if !stale {
            return;
        }

        let mut index: HashMap<IpAddress, ConnectionId> = self
            .by_address
            .iter()
            .filter(|(address, id)| {
                self.connections
                    .get(id)
                    .is_some_and(|c| c.remote_address() == **address)
            })
            .map(|(address, id)| (*address, *id))
            .collect();

        for id in self.ids() {
            let Some(connection) = self.connections.get(&id) else {
                continue;
            };
            let address = connection.remote_address();
            match index.get(&address) {
                Some(owner) if *owner != id => log::warn!(
                    "Connection {} moved to {}, already used by connection {}",
                    id,
                    address,
                    owner
                ),
                Some(_) => {}
                None => {
                    index.insert(address, id);
                }
            }
        }
        self.by_address = index;
    }

    /// Removes and returns every connection in the terminal state.
    pub fn take_disconnected(&mut self) -> Vec<C> {
        let finished: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.connection_state() == ConnectionState::Disconnected)
            .map(|(id, _)| *id)
            .collect();

        finished.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::state::TrustZone;
    use crate::udp::UdpConnection;

    fn set(max: usize) -> ConnectionSet<UdpConnection> {
        ConnectionSet::new(max)
    }

    fn insert(set: &mut ConnectionSet<UdpConnection>, port: u16) -> Result<ConnectionId, TransportError> {
        let address = IpAddress::v4(127, 0, 0, 1, port);
        let config = ConnectionConfig::default();
        set.insert_with(address, |id| {
            UdpConnection::connector(id, address, TrustZone::default(), &config, Instant::now())
        })
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut set = set(4);
        let id = insert(&mut set, 5000).unwrap();

        assert_eq!(set.len(), 1);
        assert!(id.is_valid());
        assert_eq!(set.id_by_address(&IpAddress::v4(127, 0, 0, 1, 5000)), Some(id));
        assert_eq!(set.get(id).unwrap().connection_id(), id);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let mut set = set(4);
        insert(&mut set, 5000).unwrap();

        assert!(matches!(
            insert(&mut set, 5000),
            Err(TransportError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_connection_limit() {
        let mut set = set(2);
        insert(&mut set, 5000).unwrap();
        insert(&mut set, 5001).unwrap();

        assert!(set.is_full());
        assert!(matches!(
            insert(&mut set, 5002),
            Err(TransportError::ConnectionLimit(2))
        ));
    }

    #[test]
    fn test_ids_unique_among_live_connections() {
        let mut set = set(8);
        let a = insert(&mut set, 5000).unwrap();
        let b = insert(&mut set, 5001).unwrap();
        assert_ne!(a, b);

        set.remove(a);
        let c = insert(&mut set, 5002).unwrap();
        assert_ne!(c, b);
        assert_eq!(set.ids().len(), 2);
    }

    #[test]
    fn test_reindex_after_rebind() {
        let mut set = set(4);
        let id = insert(&mut set, 5000).unwrap();
        let moved = IpAddress::v4(10, 0, 0, 1, 6000);

        set.get_mut(id).unwrap().set_remote_address(moved);
        set.reindex();

        assert_eq!(set.id_by_address(&moved), Some(id));
        assert_eq!(set.id_by_address(&IpAddress::v4(127, 0, 0, 1, 5000)), None);
    }

    #[test]
    fn test_rebind_onto_used_address() {
        let mut set = set(4);
        let a = insert(&mut set, 5000).unwrap();
        let b = insert(&mut set, 5001).unwrap();
        let shared = IpAddress::v4(127, 0, 0, 1, 5000);

        set.get_mut(b).unwrap().set_remote_address(shared);
        set.reindex();

        assert_eq!(set.id_by_address(&shared), Some(a));
        assert_eq!(set.id_by_address(&IpAddress::v4(127, 0, 0, 1, 5001)), None);
        assert_eq!(set.by_address.len(), 1);

        // a second pass keeps the same owner
        let settled = set.by_address.clone();
        set.reindex();
        assert_eq!(set.by_address, settled);

        set.remove(a);
        set.reindex();
        assert_eq!(set.id_by_address(&shared), Some(b));
    }

    #[test]
    fn test_take_disconnected() {
        let mut set = set(4);
        let a = insert(&mut set, 5000).unwrap();
        let b = insert(&mut set, 5001).unwrap();

        set.get_mut(a).unwrap().complete_teardown();
        let removed = set.take_disconnected();

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].connection_id(), a);
        assert_eq!(set.ids(), vec![b]);
    }
}
