use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use tether::{
    Connection, ConnectionConfig, ConnectionId, ConnectionRole, ConnectionState,
    DisconnectReason, IpAddress, MAX_STREAM_FRAME, MIN_MTU, RawPacket, TcpConnection,
    TerminationEndpoint, TrustZone, UdpConnection, UserData,
};

fn udp_connector(id: u32, address: IpAddress) -> UdpConnection {
    UdpConnection::connector(
        ConnectionId::new(id),
        address,
        TrustZone::ExternalClientToServer,
        &ConnectionConfig::default(),
        Instant::now(),
    )
}

fn tcp_connector(id: u32) -> (TcpConnection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = IpAddress::from(listener.local_addr().unwrap());
    let stream = TcpStream::connect(address.socket_addr()).unwrap();
    stream.set_nonblocking(true).unwrap();
    let (peer, _) = listener.accept().unwrap();

    let connection = TcpConnection::connector(
        ConnectionId::new(id),
        address,
        stream,
        TrustZone::InternalServerToServer,
        &ConnectionConfig::default(),
        Instant::now(),
    );
    (connection, peer)
}

/// Runs the send/ack/disconnect sequence every connection type must honor.
fn check_lifecycle(connection: &mut dyn Connection) {
    let k1 = connection
        .send_unreliable_packet(&RawPacket::new(1, b"p1".to_vec()))
        .expect("send while connecting");
    assert!(!connection.was_packet_acked(k1));

    assert!(connection.disconnect(DisconnectReason::UserRequested, TerminationEndpoint::Local));
    assert!(
        connection
            .send_unreliable_packet(&RawPacket::new(1, b"p2".to_vec()))
            .is_none()
    );
    assert!(!connection.send_reliable_packet(&RawPacket::new(1, b"p3".to_vec())));
    assert!(!connection.disconnect(DisconnectReason::UserRequested, TerminationEndpoint::Local));
    assert_eq!(
        connection.disconnect_cause(),
        Some((DisconnectReason::UserRequested, TerminationEndpoint::Local))
    );
}

#[test]
fn test_udp_connection_lifecycle() {
    let address: IpAddress = "127.0.0.1:7777".parse().unwrap();
    let mut connection = udp_connector(42, address);

    assert_eq!(connection.connection_id(), ConnectionId::new(42));
    assert_eq!(connection.remote_address(), address);
    assert_eq!(connection.connection_role(), ConnectionRole::Connector);
    assert_eq!(connection.connection_state(), ConnectionState::Connecting);

    check_lifecycle(&mut connection);
    assert!(connection.connection_state() >= ConnectionState::Disconnecting);
}

#[test]
fn test_tcp_connection_lifecycle() {
    let (mut connection, _peer) = tcp_connector(42);

    assert_eq!(connection.connection_id(), ConnectionId::new(42));
    assert_eq!(connection.trust_zone(), TrustZone::InternalServerToServer);

    check_lifecycle(&mut connection);
}

#[test]
fn test_metrics_are_per_connection() {
    let mut a = udp_connector(1, "127.0.0.1:7001".parse().unwrap());
    let b = udp_connector(2, "127.0.0.1:7002".parse().unwrap());

    for i in 0..10u8 {
        assert!(a.send_reliable_packet(&RawPacket::new(1, vec![i])));
    }

    assert_eq!(a.metrics().packets_sent(), 10);
    assert_eq!(a.metrics().reliable_packets_sent(), 10);
    assert_eq!(b.metrics().packets_sent(), 0);
    assert_eq!(b.metrics().packets_received(), 0);
}

#[test]
fn test_remote_address_rebind() {
    let mut connection = udp_connector(3, "127.0.0.1:7003".parse().unwrap());
    let moved: IpAddress = "[::1]:9000".parse().unwrap();

    connection.set_remote_address(moved);

    assert_eq!(connection.remote_address(), moved);
    assert_eq!(connection.connection_id(), ConnectionId::new(3));
}

#[test]
fn test_user_data_is_opaque() {
    let mut connection = udp_connector(4, "127.0.0.1:7004".parse().unwrap());

    connection.set_user_data(Some(UserData(0xdead_beef)));
    assert_eq!(connection.user_data(), Some(UserData(0xdead_beef)));

    connection.disconnect(DisconnectReason::Shutdown, TerminationEndpoint::Local);
    assert_eq!(connection.user_data(), Some(UserData(0xdead_beef)));
}

#[test]
fn test_mtu_rules() {
    let mut udp = udp_connector(5, "127.0.0.1:7005".parse().unwrap());
    udp.set_connection_mtu(1000);
    assert_eq!(udp.connection_mtu(), 1000);
    udp.set_connection_mtu(1);
    assert_eq!(udp.connection_mtu(), MIN_MTU);

    let (mut tcp, _peer) = tcp_connector(6);
    tcp.set_connection_mtu(1000);
    tcp.set_connection_mtu(1000);
    assert_eq!(tcp.connection_mtu(), MAX_STREAM_FRAME);
}
