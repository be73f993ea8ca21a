use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};

use anyhow::anyhow;

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub enum Protocol {
    IpV4,
    IpV6,
}

/// An immutable (protocol, address, port) triple identifying a network peer or a local
///  binding. Port 0 is permitted and means "let the OS assign a port" when binding.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Endpoint {
    address: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(address: &str, port: u16) -> anyhow::Result<Endpoint> {
        let address: IpAddr = address
            .parse()
            .map_err(|_| anyhow!("invalid IP address literal: {:?}", address))?;
        Ok(Endpoint { address, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Endpoint {
        Endpoint {
            address: addr.ip(),
            port: addr.port(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self.address {
            IpAddr::V4(_) => Protocol::IpV4,
            IpAddr::V6(_) => Protocol::IpV6,
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// 224.0.0.0/4 for IP V4, ff00::/8 for IP V6
    pub fn is_multicast(&self) -> bool {
        self.address.is_multicast()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::from_socket_addr(addr)
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.socket_addr(), f)
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.socket_addr())
    }
}
