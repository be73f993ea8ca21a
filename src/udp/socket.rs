use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use anyhow::bail;
use bytes::Bytes;
use socket2::{Domain, Protocol as RawProtocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

use crate::endpoint::Endpoint;

/// Bind a UDP socket, optionally with `SO_REUSEADDR` so several processes (or several
///  clients in one process) can share a multicast port on the same host. `socket2` is
///  needed because the option must be set before `bind`.
pub(crate) fn bind_udp(endpoint: Endpoint, reuse_address: bool) -> anyhow::Result<UdpSocket> {
    let addr = endpoint.socket_addr();
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(RawProtocol::UDP))?;
    if reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// IGMP/MLD group membership. Joining an already-joined group is reported as success by
///  the kernel on some platforms and as `EADDRINUSE` on others; both are treated as
///  idempotent success here.
pub(crate) fn join_group(socket: &UdpSocket, group: IpAddr) -> anyhow::Result<()> {
    if !group.is_multicast() {
        bail!("not a multicast address: {}", group);
    }
    let result = match group {
        IpAddr::V4(group) => socket.join_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(group) => socket.join_multicast_v6(&group, 0),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn leave_group(socket: &UdpSocket, group: IpAddr) -> anyhow::Result<()> {
    if !group.is_multicast() {
        bail!("not a multicast address: {}", group);
    }
    match group {
        IpAddr::V4(group) => socket.leave_multicast_v4(group, std::net::Ipv4Addr::UNSPECIFIED)?,
        IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0)?,
    }
    Ok(())
}

/// Single-slot outbound buffer: at most one datagram pending, no queue behind it. A
///  producer whose datagram does not fit is told so immediately (send returns 0).
pub(crate) struct SendSlot {
    slot: Mutex<Option<(SocketAddr, Bytes)>>,
    available: Notify,
}

impl SendSlot {
    pub fn new() -> SendSlot {
        SendSlot {
            slot: Mutex::new(None),
            available: Notify::new(),
        }
    }

    pub fn offer(&self, to: SocketAddr, data: Bytes) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some((to, data));
        self.available.notify_one();
        true
    }

    /// Cancel safe: the slot is emptied only when this future completes.
    pub async fn take(&self) -> (SocketAddr, Bytes) {
        loop {
            if let Some(entry) = self.slot.lock().unwrap().take() {
                return entry;
            }
            self.available.notified().await;
        }
    }

    /// Discard a pending datagram so it cannot leak into the next start cycle.
    pub fn clear(&self) {
        *self.slot.lock().unwrap() = None;
    }
}
