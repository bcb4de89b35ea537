use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// A remote network endpoint. Equal only when ip, port and family all match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IpAddress {
    ip: IpAddr,
    port: u16,
}

impl IpAddress {
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub const fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    pub const fn unspecified(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Resolves `host` and returns the first address it maps to.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .map(Self::from)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No address found for {}", host),
                )
            })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        match self.ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for IpAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<IpAddress> for SocketAddr {
    fn from(addr: IpAddress) -> Self {
        addr.socket_addr()
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self::from)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let addr: IpAddress = "127.0.0.1:7777".parse().unwrap();
        assert_eq!(addr, IpAddress::v4(127, 0, 0, 1, 7777));
        assert_eq!(addr.to_string(), "127.0.0.1:7777");
        assert_eq!(addr.family(), AddressFamily::Ipv4);
    }

    #[test]
    fn test_equality_covers_port_and_family() {
        let a: IpAddress = "127.0.0.1:7777".parse().unwrap();
        let b: IpAddress = "127.0.0.1:7778".parse().unwrap();
        let c: IpAddress = "[::1]:7777".parse().unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(c.family(), AddressFamily::Ipv6);
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = IpAddress::resolve("localhost", 9000).unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }
}
