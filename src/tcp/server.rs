use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Protocol};
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::{
    drive_stream, ServerSessionEvents, Session, SessionHandler, SessionRegistry,
    DEFAULT_CHUNK_SIZE,
};
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::util::task_group::TaskGroup;
use crate::write_queue::WriteQueueConfig;

#[derive(Clone, Debug)]
pub struct TcpServerConfig {
    pub endpoint: Endpoint,
    /// `SO_REUSEADDR` on the listen socket
    pub reuse_address: bool,
    /// `TCP_NODELAY` on accepted sockets
    pub no_delay: bool,
    /// receive granularity per read operation
    pub chunk_size: usize,
    pub write_queue: WriteQueueConfig,
    /// how long a graceful disconnect may keep writing queued data
    pub drain_timeout: Option<Duration>,
}

impl TcpServerConfig {
    pub fn new(endpoint: Endpoint) -> TcpServerConfig {
        TcpServerConfig {
            endpoint,
            reuse_address: true,
            no_delay: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_queue: WriteQueueConfig::default(),
            drain_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Accepts TCP connections on behalf of a [Service], owning one [Session] per live peer.
///
/// `start` binds and begins accepting; `stop` disconnects every session and blocks until
///  each has fired `on_disconnected` (and must therefore not be called from a worker
///  thread). Aggregate statistics cover live sessions plus everything that already
///  disconnected.
pub struct TcpServer {
    id: Uuid,
    service: Arc<Service>,
    config: TcpServerConfig,
    handler: Arc<dyn SessionHandler>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    registry: Arc<SessionRegistry<Session>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl TcpServer {
    pub fn new(
        service: Arc<Service>,
        config: TcpServerConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> TcpServer {
        TcpServer {
            id: Uuid::new_v4(),
            service,
            config,
            handler,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            registry: SessionRegistry::new(),
            totals: Arc::new(TrafficStats::default()),
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

    /// The actually bound address - differs from the configured endpoint when port 0 was
    ///  requested.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.local_addr.lock().unwrap().map(Endpoint::from_socket_addr)
    }

    pub fn connected_sessions(&self) -> usize {
        self.registry.len()
    }

    pub fn session(&self, id: Uuid) -> Option<Arc<Session>> {
        self.registry.get(id)
    }

    pub fn stats(&self) -> TrafficSnapshot {
        let mut aggregate = self.totals.snapshot();
        for session in self.registry.snapshot() {
            aggregate.merge(session.stats());
        }
        aggregate
    }

    /// Bind the listen socket and start accepting. Blocks until the socket is bound (so
    ///  [Self::local_endpoint] is meaningful immediately afterwards). Returns false if
    ///  already started, the service is not running, or the bind failed - the bind error
    ///  is additionally reported through `on_error`.
    pub fn start(&self) -> bool {
        if !self.service.is_started() {
            warn!(server = %self.id, "cannot start server: service is not started");
            return false;
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

        let (bind_tx, bind_rx) = mpsc::channel();
        let ctx = AcceptContext {
            server_id: self.id,
            service: self.service.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            registry: self.registry.clone(),
            totals: self.totals.clone(),
            tasks: self.tasks.clone(),
            service_shutdown,
            server_shutdown: shutdown_rx,
        };
        let accept = self.tasks.track(accept_loop(ctx, bind_tx));
        if !self.service.spawn_tracked(accept) {
            self.started.store(false, Ordering::Release);
            return false;
        }

        match bind_rx.recv() {
            Ok(Some(addr)) => {
                *self.local_addr.lock().unwrap() = Some(addr);
                info!(server = %self.id, %addr, "server started");
                true
            }
            _ => {
                self.started.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stop accepting, disconnect all sessions and block until each fired
    ///  `on_disconnected`. Must not be called from a worker thread.
    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        self.tasks.wait_idle();
        *self.local_addr.lock().unwrap() = None;
        info!(server = %self.id, "server stopped");
        true
    }

    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        self.start()
    }

    /// Enqueue `data` on every connected session, best effort per session.
    pub fn broadcast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.send(data);
        }
        true
    }

    /// Initiate a graceful disconnect of every session without stopping the listener.
    ///  Does not wait for the disconnects to complete.
    pub fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.disconnect();
        }
        true
    }
}

struct AcceptContext {
    server_id: Uuid,
    service: Arc<Service>,
    config: TcpServerConfig,
    handler: Arc<dyn SessionHandler>,
    registry: Arc<SessionRegistry<Session>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    service_shutdown: watch::Receiver<bool>,
    server_shutdown: watch::Receiver<bool>,
}

fn bind_listener(config: &TcpServerConfig) -> anyhow::Result<TcpListener> {
    let socket = match config.endpoint.protocol() {
        Protocol::IpV4 => TcpSocket::new_v4()?,
        Protocol::IpV6 => TcpSocket::new_v6()?,
    };
    if config.reuse_address {
        socket.set_reuseaddr(true)?;
    }
    socket.bind(config.endpoint.socket_addr())?;
    Ok(socket.listen(1024)?)
}

async fn accept_loop(ctx: AcceptContext, bind_result: mpsc::Sender<Option<SocketAddr>>) {
    let listener = match bind_listener(&ctx.config) {
        Ok(listener) => {
            let _ = bind_result.send(listener.local_addr().ok());
            listener
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
    loop {
        tokio::select! {
            _ = async { let _ = service_shutdown.wait_for(|v| *v).await; } => break,
            _ = async { let _ = server_shutdown.wait_for(|v| *v).await; } => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => on_accepted(&ctx, stream, peer),
                    Err(e) => {
                        // report and keep accepting - a single failed accept does not
                        //  take the server down
                        warn!(server = %ctx.server_id, "accept failed: {}", e);
                        ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
                    }
                }
            }
        }
    }
    debug!(server = %ctx.server_id, "accept loop terminated");
}

fn on_accepted(ctx: &AcceptContext, stream: TcpStream, peer: SocketAddr) {
    if ctx.config.no_delay {
        let _ = stream.set_nodelay(true);
    }

    let session = Session::new(ctx.server_id, peer.into(), ctx.config.write_queue);
    debug!(server = %ctx.server_id, session = %session.id(), %peer, "accepted connection");
    ctx.registry.insert(session.id(), session.clone());

    let events = Arc::new(ServerSessionEvents {
        session: session.clone(),
        handler: ctx.handler.clone(),
        registry: ctx.registry.clone(),
        totals: ctx.totals.clone(),
    });
    let driver = drive_stream(
        stream,
        session.clone(),
        events,
        ctx.config.chunk_size,
        ctx.config.drain_timeout,
        ctx.service_shutdown.clone(),
        Some(ctx.server_shutdown.clone()),
    );
    if !ctx.service.spawn_tracked(ctx.tasks.track(driver)) {
        // service is shutting down underneath us
        ctx.registry.remove(session.id());
    }
}
