use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::{Endpoint, Protocol};
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::SessionRegistry;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::tls::config::TlsServerOptions;
use crate::util::task_group::TaskGroup;
use crate::write_queue::WriteQueueConfig;
use crate::ws::session::{drive_ws, WsServerSessionEvents, WsSession, WsSessionHandler};

#[derive(Clone, Debug)]
pub struct WsServerConfig {
    pub endpoint: Endpoint,
    /// present = `wss://`: accepted sockets are TLS-wrapped before the HTTP upgrade
    pub tls: Option<TlsServerOptions>,
    pub reuse_address: bool,
    pub no_delay: bool,
    pub write_queue: WriteQueueConfig,
    /// covers the TLS handshake (if any) plus the HTTP upgrade
    pub handshake_timeout: Duration,
    /// how long [WsSession::disconnect] waits for the peer to mirror the close frame
    pub close_timeout: Duration,
}

impl WsServerConfig {
    pub fn new(endpoint: Endpoint) -> WsServerConfig {
        WsServerConfig {
            endpoint,
            tls: None,
            reuse_address: true,
            no_delay: false,
            write_queue: WriteQueueConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket server over TCP or TLS. Each accepted socket goes through the (optional)
///  TLS handshake and the HTTP/1.1 upgrade before a session exists; any request path is
///  accepted. Broadcast sends one binary frame to every connected session.
pub struct WsServer {
    id: Uuid,
    service: Arc<Service>,
    config: WsServerConfig,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn WsSessionHandler>,
    started: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    registry: Arc<SessionRegistry<WsSession>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl WsServer {
    /// Fails if TLS is configured and the material cannot be loaded.
    pub fn new(
        service: Arc<Service>,
        config: WsServerConfig,
        handler: Arc<dyn WsSessionHandler>,
    ) -> anyhow::Result<WsServer> {
        let acceptor = match &config.tls {
            Some(tls) => Some(tls.build_acceptor()?),
            None => None,
        };
        Ok(WsServer {
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

    pub fn session(&self, id: Uuid) -> Option<Arc<WsSession>> {
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
                info!(server = %self.id, %addr, tls = self.acceptor.is_some(), "WebSocket server started");
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
        info!(server = %self.id, "WebSocket server stopped");
        true
    }

    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        self.start()
    }

    /// Send one binary frame to every connected session, best effort per session.
    pub fn broadcast(&self, data: &[u8]) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.send(data);
        }
        true
    }

    /// Send one text frame to every connected session.
    pub fn broadcast_text(&self, text: &str) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.send_text(text);
        }
        true
    }

    pub fn disconnect_all(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        for session in self.registry.snapshot() {
            session.disconnect(1001, "server shutting down");
        }
        true
    }
}

struct AcceptContext {
    server_id: Uuid,
    service: Arc<Service>,
    config: WsServerConfig,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn WsSessionHandler>,
    registry: Arc<SessionRegistry<WsSession>>,
    totals: Arc<TrafficStats>,
    tasks: Arc<TaskGroup>,
    service_shutdown: watch::Receiver<bool>,
    server_shutdown: watch::Receiver<bool>,
}

fn bind_listener(config: &WsServerConfig) -> anyhow::Result<TcpListener> {
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

struct ConnectionContext {
    server_id: Uuid,
    config: WsServerConfig,
    handler: Arc<dyn WsSessionHandler>,
    registry: Arc<SessionRegistry<WsSession>>,
    totals: Arc<TrafficStats>,
    service_shutdown: watch::Receiver<bool>,
    server_shutdown: watch::Receiver<bool>,
}

fn on_accepted(ctx: &AcceptContext, stream: TcpStream, peer: SocketAddr) {
    if ctx.config.no_delay {
        let _ = stream.set_nodelay(true);
    }

    let acceptor = ctx.acceptor.clone();
    let conn = ConnectionContext {
        server_id: ctx.server_id,
        config: ctx.config.clone(),
        handler: ctx.handler.clone(),
        registry: ctx.registry.clone(),
        totals: ctx.totals.clone(),
        service_shutdown: ctx.service_shutdown.clone(),
        server_shutdown: ctx.server_shutdown.clone(),
    };

    let connection = async move {
        match acceptor {
            Some(acceptor) => {
                let tls_stream = match timeout(conn.config.handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls_stream)) => tls_stream,
                    Ok(Err(e)) => {
                        debug!(server = %conn.server_id, %peer, "TLS handshake failed: {}", e);
                        conn.handler
                            .on_error(&ErrorInfo::tls(format!("handshake with {} failed: {}", peer, e)))
                            .await;
                        return;
                    }
                    Err(_) => {
                        conn.handler
                            .on_error(&ErrorInfo::tls(format!("handshake with {} timed out", peer)))
                            .await;
                        return;
                    }
                };
                upgrade_and_drive(conn, tls_stream, peer).await;
            }
            None => upgrade_and_drive(conn, stream, peer).await,
        }
    };
    ctx.service.spawn_tracked(ctx.tasks.track(connection));
}

async fn upgrade_and_drive<S>(ctx: ConnectionContext, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = match timeout(ctx.config.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(server = %ctx.server_id, %peer, "upgrade failed: {}", e);
            ctx.handler
                .on_error(&ErrorInfo::websocket(format!("upgrade with {} failed: {}", peer, e)))
                .await;
            return;
        }
        Err(_) => {
            ctx.handler
                .on_error(&ErrorInfo::websocket(format!("upgrade with {} timed out", peer)))
                .await;
            return;
        }
    };

    let session = WsSession::new(ctx.server_id, peer.into(), ctx.config.write_queue);
    debug!(server = %ctx.server_id, session = %session.id(), %peer, "upgrade complete");
    ctx.registry.insert(session.id(), session.clone());

    let events = Arc::new(WsServerSessionEvents {
        session: session.clone(),
        handler: ctx.handler,
        registry: ctx.registry,
        totals: ctx.totals,
    });
    drive_ws(
        ws,
        session,
        events,
        ctx.config.close_timeout,
        ctx.service_shutdown,
        Some(ctx.server_shutdown),
    )
    .await;
}
