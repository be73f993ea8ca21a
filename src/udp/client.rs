use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Protocol};
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::DEFAULT_CHUNK_SIZE;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::udp::socket::{bind_udp, join_group, leave_group, SendSlot};
use crate::util::state_flag::StateFlag;

#[async_trait]
pub trait UdpClientHandler: Send + Sync + 'static {
    async fn on_connected(&self) {}
    async fn on_disconnected(&self) {}
    /// One complete datagram per invocation.
    async fn on_received(&self, _from: Endpoint, _data: &[u8]) {}
    async fn on_sent(&self, _to: Endpoint, _sent: usize) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

#[derive(Clone, Debug)]
pub struct UdpClientConfig {
    /// Default target for [UdpClient::send]; for a multicast subscriber this is the
    ///  group endpoint.
    pub endpoint: Endpoint,
    /// Bind to the target's port with `SO_REUSEADDR` so several clients on one host can
    ///  share a multicast port. Without this the client binds to an ephemeral port.
    pub multicast: bool,
    pub chunk_size: usize,
    pub multicast_ttl: u32,
}

impl UdpClientConfig {
    pub fn new(endpoint: Endpoint) -> UdpClientConfig {
        UdpClientConfig {
            endpoint,
            multicast: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            multicast_ttl: 1,
        }
    }
}

/// Connectionless counterpart of the TCP client: "connect" binds the local socket and
///  starts the receive loop; datagrams can then be sent to the default endpoint or to an
///  explicit one, and multicast groups can be joined and left at runtime.
pub struct UdpClient {
    id: Uuid,
    service: Arc<Service>,
    config: UdpClientConfig,
    handler: Arc<dyn UdpClientHandler>,
    socket: Arc<Mutex<Option<Arc<UdpSocket>>>>,
    joined_groups: Mutex<FxHashSet<IpAddr>>,
    stats: Arc<TrafficStats>,
    outbound: Arc<SendSlot>,
    connected_flag: Arc<StateFlag>,
    disconnect_notify: Arc<Notify>,
    connecting: Arc<AtomicBool>,
}

impl UdpClient {
    pub fn new(
        service: Arc<Service>,
        config: UdpClientConfig,
        handler: Arc<dyn UdpClientHandler>,
    ) -> UdpClient {
        UdpClient {
            id: Uuid::new_v4(),
            service,
            config,
            handler,
            socket: Arc::new(Mutex::new(None)),
            joined_groups: Mutex::new(FxHashSet::default()),
            stats: Arc::new(TrafficStats::default()),
            outbound: Arc::new(SendSlot::new()),
            connected_flag: Arc::new(StateFlag::new(false)),
            disconnect_notify: Arc::new(Notify::new()),
            connecting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.config.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.socket.lock().unwrap().is_some()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    /// Bind the socket and start the receive loop. Blocks until the bind resolved and
    ///  `on_connected` has fired (on a worker thread). A failed bind fires `on_error`
    ///  and returns false.
    pub fn connect(&self) -> bool {
        if self.is_connected() || self.connecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(service_shutdown) = self.service.shutdown_signal() else {
            warn!(client = %self.id, "cannot connect: service is not started");
            self.connecting.store(false, Ordering::Release);
            return false;
        };

        let ctx = DriverContext {
            client_id: self.id,
            config: self.config.clone(),
            bind_endpoint: self.bind_endpoint(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            outbound: self.outbound.clone(),
            socket_slot: self.socket.clone(),
            connected_flag: self.connected_flag.clone(),
            disconnect_notify: self.disconnect_notify.clone(),
            service_shutdown,
        };
        let (ready_tx, ready_rx) = mpsc::channel();
        if !self.service.spawn_tracked(drive_socket(ctx, ready_tx)) {
            self.connecting.store(false, Ordering::Release);
            return false;
        }
        let connected = ready_rx.recv().unwrap_or(false);
        self.connecting.store(false, Ordering::Release);
        if connected {
            info!(client = %self.id, endpoint = %self.config.endpoint, "UDP client connected");
        }
        connected
    }

    /// Close the socket and block until `on_disconnected` fired. Must not be called from
    ///  a worker thread.
    pub fn disconnect(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.disconnect_notify.notify_one();
        self.connected_flag.wait_for(false);
        self.joined_groups.lock().unwrap().clear();
        true
    }

    pub fn reconnect(&self) -> bool {
        self.disconnect();
        self.connect()
    }

    /// `IP_ADD_MEMBERSHIP` / `IPV6_JOIN_GROUP` on the bound socket. Idempotent.
    pub fn join_multicast_group(&self, group: IpAddr) -> bool {
        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else { return false };
        if self.joined_groups.lock().unwrap().contains(&group) {
            return true;
        }
        match join_group(&socket, group) {
            Ok(()) => {
                debug!(client = %self.id, %group, "joined multicast group");
                self.joined_groups.lock().unwrap().insert(group);
                true
            }
            Err(e) => {
                warn!(client = %self.id, %group, "join failed: {}", e);
                false
            }
        }
    }

    /// `IP_DROP_MEMBERSHIP` / `IPV6_LEAVE_GROUP`.
    pub fn leave_multicast_group(&self, group: IpAddr) -> bool {
        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else { return false };
        if !self.joined_groups.lock().unwrap().remove(&group) {
            return false;
        }
        match leave_group(&socket, group) {
            Ok(()) => {
                debug!(client = %self.id, %group, "left multicast group");
                true
            }
            Err(e) => {
                warn!(client = %self.id, %group, "leave failed: {}", e);
                false
            }
        }
    }

    /// Send one datagram to the default endpoint.
    pub fn send(&self, data: &[u8]) -> usize {
        self.send_to(self.config.endpoint, data)
    }

    /// Send one datagram to an explicit endpoint. Returns 0 when disconnected or a send
    ///  is still in flight.
    pub fn send_to(&self, endpoint: Endpoint, data: &[u8]) -> usize {
        if !self.is_connected() || data.is_empty() {
            return 0;
        }
        if self.outbound.offer(endpoint.socket_addr(), Bytes::copy_from_slice(data)) {
            data.len()
        } else {
            0
        }
    }

    fn bind_endpoint(&self) -> Endpoint {
        let unspecified = match self.config.endpoint.protocol() {
            Protocol::IpV4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Protocol::IpV6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let port = if self.config.multicast {
            self.config.endpoint.port()
        } else {
            0
        };
        Endpoint::from_socket_addr(SocketAddr::new(unspecified, port))
    }
}

struct DriverContext {
    client_id: Uuid,
    config: UdpClientConfig,
    bind_endpoint: Endpoint,
    handler: Arc<dyn UdpClientHandler>,
    stats: Arc<TrafficStats>,
    outbound: Arc<SendSlot>,
    socket_slot: Arc<Mutex<Option<Arc<UdpSocket>>>>,
    connected_flag: Arc<StateFlag>,
    disconnect_notify: Arc<Notify>,
    service_shutdown: watch::Receiver<bool>,
}

async fn drive_socket(ctx: DriverContext, ready: mpsc::Sender<bool>) {
    // a close requested while the previous connection was tearing down must not kill
    //  this one
    let _ = futures_util::FutureExt::now_or_never(ctx.disconnect_notify.notified());

    let socket = match bind_udp(ctx.bind_endpoint, ctx.config.multicast) {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!(client = %ctx.client_id, "bind failed: {}", e);
            ctx.handler
                .on_error(&ErrorInfo::new(-1, crate::error::CATEGORY_SYSTEM, e.to_string()))
                .await;
            let _ = ready.send(false);
            return;
        }
    };
    if let Protocol::IpV4 = ctx.config.endpoint.protocol() {
        let _ = socket.set_multicast_ttl_v4(ctx.config.multicast_ttl);
    }

    *ctx.socket_slot.lock().unwrap() = Some(socket.clone());
    ctx.connected_flag.set(true);
    ctx.handler.on_connected().await;
    let _ = ready.send(true);

    let mut service_shutdown = ctx.service_shutdown.clone();
    let mut read_buf = vec![0u8; ctx.config.chunk_size];
    loop {
        tokio::select! {
            _ = async { let _ = service_shutdown.wait_for(|v| *v).await; } => break,
            _ = ctx.disconnect_notify.notified() => break,
            received = socket.recv_from(&mut read_buf) => {
                match received {
                    Ok((n, from)) => {
                        ctx.stats.add_received(n);
                        ctx.handler.on_received(Endpoint::from_socket_addr(from), &read_buf[..n]).await;
                    }
                    Err(e) if crate::error::is_transient(&e) => {}
                    Err(e) => {
                        warn!(client = %ctx.client_id, "receive failed: {}", e);
                        ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
                    }
                }
            }
            (to, data) = ctx.outbound.take() => {
                match socket.send_to(&data, to).await {
                    Ok(n) => {
                        ctx.stats.add_sent(n);
                        ctx.handler.on_sent(Endpoint::from_socket_addr(to), n).await;
                    }
                    Err(e) => {
                        debug!(client = %ctx.client_id, "send to {} failed: {}", to, e);
                        ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
                    }
                }
            }
        }
    }

    *ctx.socket_slot.lock().unwrap() = None;
    ctx.outbound.clear();
    ctx.handler.on_disconnected().await;
    ctx.connected_flag.set(false);
    debug!(client = %ctx.client_id, "UDP client loop terminated");
}
