use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::tls::config::TlsClientOptions;
use crate::util::state_flag::StateFlag;
use crate::write_queue::WriteQueueConfig;
use crate::ws::session::{drive_ws, WsClientSessionEvents, WsSession};

/// Client-side callbacks of a WebSocket connection.
#[async_trait]
pub trait WsClientHandler: Send + Sync + 'static {
    async fn on_connected(&self) {}
    async fn on_received(&self, _message: &Message) {}
    async fn on_sent(&self, _sent: usize, _pending: usize) {}
    async fn on_close(&self, _code: u16, _reason: &str) {}
    async fn on_disconnected(&self) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

#[derive(Clone, Debug)]
pub struct WsClientConfig {
    pub endpoint: Endpoint,
    /// request path of the upgrade request
    pub path: String,
    /// present = `wss://`
    pub tls: Option<TlsClientOptions>,
    pub write_queue: WriteQueueConfig,
    pub handshake_timeout: Duration,
    pub close_timeout: Duration,
}

impl WsClientConfig {
    pub fn new(endpoint: Endpoint) -> WsClientConfig {
        WsClientConfig {
            endpoint,
            path: "/".to_owned(),
            tls: None,
            write_queue: WriteQueueConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket client over TCP or TLS: connect, upgrade, then framed send/receive mirroring
///  the server-side session. The client identifier stays the same across reconnects.
pub struct WsClient {
    id: Uuid,
    service: Arc<Service>,
    config: WsClientConfig,
    connector: Option<TlsConnector>,
    server_name: Option<ServerName<'static>>,
    handler: Arc<dyn WsClientHandler>,
    current: Arc<Mutex<Option<Arc<WsSession>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
}

impl WsClient {
    /// Fails if TLS is configured and the material cannot be loaded.
    pub fn new(
        service: Arc<Service>,
        config: WsClientConfig,
        handler: Arc<dyn WsClientHandler>,
    ) -> anyhow::Result<WsClient> {
        let (connector, server_name) = match &config.tls {
            Some(tls) => {
                let connector = tls.build_connector()?;
                let server_name = match &tls.server_name {
                    Some(name) => ServerName::try_from(name.clone())
                        .map_err(|_| anyhow::anyhow!("invalid server name: {:?}", name))?,
                    None => ServerName::from(config.endpoint.address()),
                };
                (Some(connector), Some(server_name))
            }
            None => (None, None),
        };
        Ok(WsClient {
            id: Uuid::new_v4(),
            service,
            config,
            connector,
            server_name,
            handler,
            current: Arc::new(Mutex::new(None)),
            totals: Arc::new(TrafficStats::default()),
            connected_flag: Arc::new(StateFlag::new(false)),
            connecting: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.config.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        let mut aggregate = self.totals.snapshot();
        if let Some(session) = self.current.lock().unwrap().as_ref() {
            aggregate.merge(session.stats());
        }
        aggregate
    }

    /// Connect, handshake and upgrade; blocks until all phases resolved. Failure in any
    ///  phase fires `on_error` and returns false without firing `on_connected`.
    pub fn connect(&self) -> bool {
        let (tx, rx) = mpsc::channel();
        if !self.spawn_connect(Some(tx)) {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Fire-and-forget connect; safe to call from inside callbacks.
    pub fn connect_async(&self) -> bool {
        self.spawn_connect(None)
    }

    fn spawn_connect(&self, result: Option<mpsc::Sender<bool>>) -> bool {
        if self.is_connected() || self.connecting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Some(service_shutdown) = self.service.shutdown_signal() else {
            warn!(client = %self.id, "cannot connect: service is not started");
            self.connecting.store(false, Ordering::Release);
            return false;
        };

        let ctx = ConnectContext {
            client_id: self.id,
            config: self.config.clone(),
            connector: self.connector.clone(),
            server_name: self.server_name.clone(),
            handler: self.handler.clone(),
            current: self.current.clone(),
            totals: self.totals.clone(),
            connected_flag: self.connected_flag.clone(),
            connecting: self.connecting.clone(),
            service_shutdown,
        };
        let spawned = self.service.spawn_tracked(async move {
            connect_and_drive(ctx, result).await;
        });
        if !spawned {
            self.connecting.store(false, Ordering::Release);
        }
        spawned
    }

    /// Close with the given code and reason and block until `on_disconnected` fired.
    ///  Must not be called from a worker thread.
    pub fn disconnect_with(&self, code: u16, reason: &str) -> bool {
        let session = self.current.lock().unwrap().clone();
        match session {
            Some(session) => {
                session.disconnect(code, reason);
                self.connected_flag.wait_for(false);
                true
            }
            None => false,
        }
    }

    /// Normal closure (code 1000).
    pub fn disconnect(&self) -> bool {
        self.disconnect_with(1000, "")
    }

    /// Request a close without waiting. Safe to call from callbacks.
    pub fn disconnect_async(&self) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.disconnect(1000, ""),
            None => false,
        }
    }

    pub fn reconnect(&self) -> bool {
        self.disconnect();
        self.connect()
    }

    /// Queue one binary frame.
    pub fn send(&self, data: &[u8]) -> usize {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.send(data),
            None => 0,
        }
    }

    /// Queue one text frame.
    pub fn send_text(&self, text: &str) -> usize {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.send_text(text),
            None => 0,
        }
    }

    pub fn send_frame(&self, message: Message) -> usize {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.send_frame(message),
            None => 0,
        }
    }
}

struct ConnectContext {
    client_id: Uuid,
    config: WsClientConfig,
    connector: Option<TlsConnector>,
    server_name: Option<ServerName<'static>>,
    handler: Arc<dyn WsClientHandler>,
    current: Arc<Mutex<Option<Arc<WsSession>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
    service_shutdown: watch::Receiver<bool>,
}

impl ConnectContext {
    fn url(&self) -> String {
        let scheme = if self.connector.is_some() { "wss" } else { "ws" };
        format!("{}://{}{}", scheme, self.config.endpoint.socket_addr(), self.config.path)
    }

    async fn report_failure(&self, error: ErrorInfo, result: &Option<mpsc::Sender<bool>>) {
        self.handler.on_error(&error).await;
        self.connecting.store(false, Ordering::Release);
        if let Some(result) = result {
            let _ = result.send(false);
        }
    }
}

async fn connect_and_drive(ctx: ConnectContext, result: Option<mpsc::Sender<bool>>) {
    let stream = match TcpStream::connect(ctx.config.endpoint.socket_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client = %ctx.client_id, "connect to {} failed: {}", ctx.config.endpoint, e);
            ctx.report_failure(ErrorInfo::from_io(&e), &result).await;
            return;
        }
    };

    match (ctx.connector.clone(), ctx.server_name.clone()) {
        (Some(connector), Some(server_name)) => {
            let handshake = connector.connect(server_name, stream);
            let tls_stream = match timeout(ctx.config.handshake_timeout, handshake).await {
                Ok(Ok(tls_stream)) => tls_stream,
                Ok(Err(e)) => {
                    ctx.report_failure(
                        ErrorInfo::tls(format!("handshake with {} failed: {}", ctx.config.endpoint, e)),
                        &result,
                    )
                    .await;
                    return;
                }
                Err(_) => {
                    ctx.report_failure(
                        ErrorInfo::tls(format!("handshake with {} timed out", ctx.config.endpoint)),
                        &result,
                    )
                    .await;
                    return;
                }
            };
            upgrade_and_drive(ctx, tls_stream, result).await;
        }
        _ => upgrade_and_drive(ctx, stream, result).await,
    }
}

async fn upgrade_and_drive<S>(ctx: ConnectContext, stream: S, result: Option<mpsc::Sender<bool>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let upgrade = client_async(ctx.url(), stream);
    let ws = match timeout(ctx.config.handshake_timeout, upgrade).await {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            ctx.report_failure(
                ErrorInfo::websocket(format!("upgrade with {} failed: {}", ctx.config.endpoint, e)),
                &result,
            )
            .await;
            return;
        }
        Err(_) => {
            ctx.report_failure(
                ErrorInfo::websocket(format!("upgrade with {} timed out", ctx.config.endpoint)),
                &result,
            )
            .await;
            return;
        }
    };

    let session = WsSession::new(ctx.client_id, ctx.config.endpoint, ctx.config.write_queue);
    *ctx.current.lock().unwrap() = Some(session.clone());
    ctx.connected_flag.set(true);
    ctx.connecting.store(false, Ordering::Release);
    info!(client = %ctx.client_id, endpoint = %ctx.config.endpoint, "WebSocket client connected");
    if let Some(result) = result {
        let _ = result.send(true);
    }

    let events = Arc::new(WsClientSessionEvents {
        session: session.clone(),
        handler: ctx.handler.clone(),
        current: ctx.current.clone(),
        totals: ctx.totals.clone(),
        connected_flag: ctx.connected_flag.clone(),
    });
    drive_ws(
        ws,
        session,
        events,
        ctx.config.close_timeout,
        ctx.service_shutdown.clone(),
        None,
    )
    .await;
}
