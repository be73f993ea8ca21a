use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
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
use crate::tls::config::TlsServerOptions;
use crate::util::task_group::TaskGroup;
use crate::write_queue::WriteQueueConfig;

#[derive(Clone, Debug)]
pub struct TlsServerConfig {
    pub endpoint: Endpoint,
    pub tls: TlsServerOptions,
    pub reuse_address: bool,
    pub no_delay: bool,
    pub chunk_size: usize,
    pub write_queue: WriteQueueConfig,
    pub drain_timeout: Option<Duration>,
    /// a peer that stalls the handshake is cut off after this long
    pub handshake_timeout: Duration,
}

impl TlsServerConfig {
    pub fn new(endpoint: Endpoint, tls: TlsServerOptions) -> TlsServerConfig {
        TlsServerConfig {
            endpoint,
            tls,
            reuse_address: true,
            no_delay: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_queue: WriteQueueConfig::default(),
            drain_timeout: Some(Duration::from_secs(1)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// TCP server with a TLS handshake phase in front of every session. `on_connected` fires
///  only after a successful handshake; a failed handshake fires `on_error` and closes the
///  socket without ever creating a session. All sessions share the acceptor built from
///  the server's [TlsServerOptions].
pub struct TlsServer {
    id: Uuid,
    service: Arc<Service>,
    config: TlsServerConfig,
    acceptor: TlsAcceptor,
    handler: Arc<dyn SessionHandler>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    registry: Arc<SessionRegistry<Session>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl TlsServer {
    /// Fails if the configured certificate chain / private key / CA pool cannot be
    ///  loaded.
    pub fn new(
        service: Arc<Service>,
        config: TlsServerConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> anyhow::Result<TlsServer> {
        let acceptor = config.tls.build_acceptor()?;
        Ok(TlsServer {
            id: Uuid::new_v4(),
            service,
            config,
            acceptor,
            handler,
            started: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            registry: SessionRegistry::new(),
            totals: Arc::new(TrafficStats::default()),
            tasks: Arc::new(TaskGroup::new()),
            shutdown: Mutex::new(None),
        })
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
            acceptor: self.acceptor.clone(),
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
                info!(server = %self.id, %addr, "TLS server started");
                true
            }
            _ => {
                self.started.store(false, Ordering::Release);
                false
            }
        }
    }

    /// See [crate::tcp::TcpServer::stop]; must not be called from a worker thread.
    pub fn stop(&self) -> bool {
        if !self.started.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        self.tasks.wait_idle();
        *self.local_addr.lock().unwrap() = None;
        info!(server = %self.id, "TLS server stopped");
        true
    }

    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        self.start()
    }

    pub fn broadcast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.send(data);
        }
        true
    }

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
    config: TlsServerConfig,
    acceptor: TlsAcceptor,
    handler: Arc<dyn SessionHandler>,
    registry: Arc<SessionRegistry<Session>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    service_shutdown: watch::Receiver<bool>,
    server_shutdown: watch::Receiver<bool>,
}

fn bind_listener(config: &TlsServerConfig) -> anyhow::Result<TcpListener> {
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

    let server_id = ctx.server_id;
    let acceptor = ctx.acceptor.clone();
    let handler = ctx.handler.clone();
    let registry = ctx.registry.clone();
    let totals = ctx.totals.clone();
    let config = ctx.config.clone();
    let service_shutdown = ctx.service_shutdown.clone();
    let server_shutdown = ctx.server_shutdown.clone();

    // the handshake runs in the per-connection task so a slow peer cannot stall accepts
    let connection = async move {
        let tls_stream = match timeout(config.handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                debug!(server = %server_id, %peer, "handshake failed: {}", e);
                handler.on_error(&ErrorInfo::tls(format!("handshake with {} failed: {}", peer, e))).await;
                return;
            }
            Err(_) => {
                debug!(server = %server_id, %peer, "handshake timed out");
                handler.on_error(&ErrorInfo::tls(format!("handshake with {} timed out", peer))).await;
                return;
            }
        };

        let session = Session::new(server_id, peer.into(), config.write_queue);
        debug!(server = %server_id, session = %session.id(), %peer, "handshake complete");
        registry.insert(session.id(), session.clone());

        let events = Arc::new(ServerSessionEvents {
            session: session.clone(),
            handler,
            registry,
            totals,
        });
        drive_stream(
            tls_stream,
            session,
            events,
            config.chunk_size,
            config.drain_timeout,
            service_shutdown,
            Some(server_shutdown),
        )
        .await;
    };
    ctx.service.spawn_tracked(ctx.tasks.track(connection));
}
