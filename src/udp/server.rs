use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::DEFAULT_CHUNK_SIZE;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::udp::socket::{bind_udp, SendSlot};
use crate::util::task_group::TaskGroup;

/// Callbacks of a UDP server. UDP is connectionless, so there are no per-peer sessions;
///  datagram sources are identified by endpoint.
#[async_trait]
pub trait UdpServerHandler: Send + Sync + 'static {
    /// One complete datagram per invocation - the buffer is exactly the datagram.
    async fn on_received(&self, _from: Endpoint, _data: &[u8]) {}
    async fn on_sent(&self, _to: Endpoint, _sent: usize) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

#[derive(Clone, Debug)]
pub struct UdpServerConfig {
    pub endpoint: Endpoint,
    pub reuse_address: bool,
    /// receive buffer size; datagrams longer than this are truncated by the kernel
    pub chunk_size: usize,
    /// TTL for outgoing multicast datagrams
    pub multicast_ttl: u32,
}

impl UdpServerConfig {
    pub fn new(endpoint: Endpoint) -> UdpServerConfig {
        UdpServerConfig {
            endpoint,
            reuse_address: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            multicast_ttl: 1,
        }
    }
}

/// A bound UDP socket issuing receives, with an optional multicast group it sends to.
///  Outbound traffic keeps a single pending send: a `send` while one is in flight
///  returns 0 instead of queueing.
pub struct UdpServer {
    id: Uuid,
    service: Arc<Service>,
    config: UdpServerConfig,
    handler: Arc<dyn UdpServerHandler>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    multicast_group: Mutex<Option<Endpoint>>,
    stats: Arc<TrafficStats>,
    outbound: Arc<SendSlot>,
    tasks: Arc<TaskGroup>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl UdpServer {
    pub fn new(
        service: Arc<Service>,
        config: UdpServerConfig,
        handler: Arc<dyn UdpServerHandler>,
    ) -> UdpServer {
        UdpServer {
            id: Uuid::new_v4(),
            service,
            config,
            handler,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            multicast_group: Mutex::new(None),
            stats: Arc::new(TrafficStats::default()),
            outbound: Arc::new(SendSlot::new()),
            tasks: Arc::new(TaskGroup::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_addr.lock().unwrap().map(Endpoint::from_socket_addr)
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    /// Bind and start receiving. With `multicast` set, outgoing [Self::multicast] calls
    ///  target that group. The server only sends to the group - receiving group traffic
    ///  is the clients' side, via their group membership.
    pub fn start(&self, multicast: Option<Endpoint>) -> bool {
        if !self.service.is_started() {
            warn!(server = %self.id, "cannot start server: service is not started");
            return false;
        }
        if let Some(group) = &multicast {
            if !group.is_multicast() {
                warn!(server = %self.id, "not a multicast group address: {}", group);
                return false;
            }
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let Some(service_shutdown) = self.service.shutdown_signal() else {
            self.started.store(false, Ordering::Release);
            return false;
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.multicast_group.lock().unwrap() = multicast;

        let (bind_tx, bind_rx) = mpsc::channel();
        let ctx = DriverContext {
            server_id: self.id,
            config: self.config.clone(),
            multicast,
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            outbound: self.outbound.clone(),
            service_shutdown,
            server_shutdown: shutdown_rx,
        };
        let driver = self.tasks.track(drive_socket(ctx, bind_tx));
        if !self.service.spawn_tracked(driver) {
            self.started.store(false, Ordering::Release);
            return false;
        }

        match bind_rx.recv() {
            Ok(Some(addr)) => {
                *self.local_addr.lock().unwrap() = Some(addr);
                info!(server = %self.id, %addr, "UDP server started");
                true
            }
            _ => {
                self.started.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        self.tasks.wait_idle();
        self.outbound.clear();
        *self.local_addr.lock().unwrap() = None;
        *self.multicast_group.lock().unwrap() = None;
        info!(server = %self.id, "UDP server stopped");
        true
    }

    pub fn restart(&self) -> bool {
        let multicast = *self.multicast_group.lock().unwrap();
        if !self.stop() {
            return false;
        }
        self.start(multicast)
    }

    /// Send one datagram to `endpoint`. Returns the number of bytes handed to the send
    ///  slot, 0 when the server is stopped or a send is still in flight.
    pub fn send(&self, endpoint: Endpoint, data: &[u8]) -> usize {
        if !self.is_started() || data.is_empty() {
            return 0;
        }
        if self.outbound.offer(endpoint.socket_addr(), Bytes::copy_from_slice(data)) {
            data.len()
        } else {
            0
        }
    }

    /// Send one datagram to the multicast group configured at start.
    pub fn multicast(&self, data: &[u8]) -> usize {
        let group = *self.multicast_group.lock().unwrap();
        match group {
            Some(group) => self.send(group, data),
            None => 0,
        }
    }
}

struct DriverContext {
    server_id: Uuid,
    config: UdpServerConfig,
    multicast: Option<Endpoint>,
    handler: Arc<dyn UdpServerHandler>,
    stats: Arc<TrafficStats>,
    outbound: Arc<SendSlot>,
    service_shutdown: watch::Receiver<bool>,
    server_shutdown: watch::Receiver<bool>,
}

fn setup_socket(ctx: &DriverContext) -> anyhow::Result<UdpSocket> {
    let socket = bind_udp(ctx.config.endpoint, ctx.config.reuse_address)?;
    if let Some(group) = &ctx.multicast {
        match group.address() {
            std::net::IpAddr::V4(_) => socket.set_multicast_ttl_v4(ctx.config.multicast_ttl)?,
            std::net::IpAddr::V6(_) => socket.set_multicast_loop_v6(true)?,
        }
    }
    Ok(socket)
}

async fn drive_socket(ctx: DriverContext, bind_result: mpsc::Sender<Option<SocketAddr>>) {
    let socket = match setup_socket(&ctx) {
        Ok(socket) => {
            let _ = bind_result.send(socket.local_addr().ok());
            socket
        }
        Err(e) => {
            warn!(server = %ctx.server_id, "bind failed: {}", e);
            ctx.handler
                .on_error(&ErrorInfo::new(-1, crate::error::CATEGORY_SYSTEM, e.to_string()))
                .await;
            let _ = bind_result.send(None);
            return;
        }
    };

    let mut service_shutdown = ctx.service_shutdown.clone();
    let mut server_shutdown = ctx.server_shutdown.clone();
    let mut read_buf = vec![0u8; ctx.config.chunk_size];
    loop {
        tokio::select! {
            _ = async { let _ = service_shutdown.wait_for(|v| *v).await; } => break,
            _ = async { let _ = server_shutdown.wait_for(|v| *v).await; } => break,
            received = socket.recv_from(&mut read_buf) => {
                match received {
                    Ok((n, from)) => {
                        ctx.stats.add_received(n);
                        ctx.handler.on_received(Endpoint::from_socket_addr(from), &read_buf[..n]).await;
                    }
                    Err(e) if crate::error::is_transient(&e) => {}
                    Err(e) => {
                        // a failed receive does not take the socket down, keep receiving
                        warn!(server = %ctx.server_id, "receive failed: {}", e);
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
                        debug!(server = %ctx.server_id, "send to {} failed: {}", to, e);
                        ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
                    }
                }
            }
        }
    }
    debug!(server = %ctx.server_id, "receive loop terminated");
}
