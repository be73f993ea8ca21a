use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::{
    drive_stream, ClientHandler, ClientSessionEvents, Session, DEFAULT_CHUNK_SIZE,
};
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::tls::config::TlsClientOptions;
use crate::util::state_flag::StateFlag;
use crate::write_queue::WriteQueueConfig;

#[derive(Clone, Debug)]
pub struct TlsClientConfig {
    pub endpoint: Endpoint,
    pub tls: TlsClientOptions,
    pub no_delay: bool,
    pub chunk_size: usize,
    pub write_queue: WriteQueueConfig,
    pub drain_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
}

impl TlsClientConfig {
    pub fn new(endpoint: Endpoint, tls: TlsClientOptions) -> TlsClientConfig {
        TlsClientConfig {
            endpoint,
            tls,
            no_delay: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_queue: WriteQueueConfig::default(),
            drain_timeout: Some(Duration::from_secs(1)),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// TCP client with a client-side TLS handshake after the connect. The server certificate
///  is verified against the configured CA pool and the endpoint address (or the
///  configured `server_name`). `on_connected` fires only once the handshake succeeded.
pub struct TlsClient {
    id: Uuid,
    service: Arc<Service>,
    config: TlsClientConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handler: Arc<dyn ClientHandler>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
}

impl TlsClient {
    /// Fails if the TLS material cannot be loaded or the server name is not a valid
    ///  certificate subject.
    pub fn new(
        service: Arc<Service>,
        config: TlsClientConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> anyhow::Result<TlsClient> {
        let connector = config.tls.build_connector()?;
        let server_name = match &config.tls.server_name {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|_| anyhow::anyhow!("invalid server name: {:?}", name))?,
            None => ServerName::from(config.endpoint.address()),
        };
        Ok(TlsClient {
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

    /// Connect, perform the handshake and block until both resolved. A failure in either
    ///  phase fires `on_error` (category `"tls"` for handshake problems) and returns
    ///  false without firing `on_connected`.
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

    /// Gracefully disconnect (sends close_notify) and block until `on_disconnected`
    ///  fired. Must not be called from a worker thread.
    pub fn disconnect(&self) -> bool {
        let session = self.current.lock().unwrap().clone();
        match session {
            Some(session) => {
                session.disconnect();
                self.connected_flag.wait_for(false);
                true
            }
            None => false,
        }
    }

    pub fn disconnect_async(&self) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.disconnect(),
            None => false,
        }
    }

    pub fn reconnect(&self) -> bool {
        self.disconnect();
        self.connect()
    }

    pub fn send(&self, data: &[u8]) -> usize {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.send(data),
            None => 0,
        }
    }
}

struct ConnectContext {
    client_id: Uuid,
    config: TlsClientConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handler: Arc<dyn ClientHandler>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
    service_shutdown: watch::Receiver<bool>,
}

async fn connect_and_drive(ctx: ConnectContext, result: Option<mpsc::Sender<bool>>) {
    let fail = |sent: &Option<mpsc::Sender<bool>>| {
        if let Some(sent) = sent {
            let _ = sent.send(false);
        }
    };

    let stream = match TcpStream::connect(ctx.config.endpoint.socket_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client = %ctx.client_id, "connect to {} failed: {}", ctx.config.endpoint, e);
            ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
            ctx.connecting.store(false, Ordering::Release);
            fail(&result);
            return;
        }
    };
    if ctx.config.no_delay {
        let _ = stream.set_nodelay(true);
    }

    let handshake = ctx.connector.connect(ctx.server_name.clone(), stream);
    let tls_stream = match timeout(ctx.config.handshake_timeout, handshake).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            debug!(client = %ctx.client_id, "handshake with {} failed: {}", ctx.config.endpoint, e);
            ctx.handler
                .on_error(&ErrorInfo::tls(format!("handshake with {} failed: {}", ctx.config.endpoint, e)))
                .await;
            ctx.connecting.store(false, Ordering::Release);
            fail(&result);
            return;
        }
        Err(_) => {
            ctx.handler
                .on_error(&ErrorInfo::tls(format!("handshake with {} timed out", ctx.config.endpoint)))
                .await;
            ctx.connecting.store(false, Ordering::Release);
            fail(&result);
            return;
        }
    };

    let session = Session::new(ctx.client_id, ctx.config.endpoint, ctx.config.write_queue);
    *ctx.current.lock().unwrap() = Some(session.clone());
    ctx.connected_flag.set(true);
    ctx.connecting.store(false, Ordering::Release);
    info!(client = %ctx.client_id, endpoint = %ctx.config.endpoint, "TLS client connected");
    if let Some(result) = result {
        let _ = result.send(true);
    }

    let events = Arc::new(ClientSessionEvents {
        session: session.clone(),
        handler: ctx.handler.clone(),
        current: ctx.current.clone(),
        totals: ctx.totals.clone(),
        connected_flag: ctx.connected_flag.clone(),
    });
    drive_stream(
        tls_stream,
        session,
        events,
        ctx.config.chunk_size,
        ctx.config.drain_timeout,
        ctx.service_shutdown,
        None,
    )
    .await;
}
