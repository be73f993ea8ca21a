use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::service::Service;
use crate::session::{
    drive_stream, ClientHandler, ClientSessionEvents, Session, DEFAULT_CHUNK_SIZE,
};
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::util::state_flag::StateFlag;
use crate::write_queue::WriteQueueConfig;

#[derive(Clone, Debug)]
pub struct TcpClientConfig {
    pub endpoint: Endpoint,
    pub no_delay: bool,
    pub chunk_size: usize,
    pub write_queue: WriteQueueConfig,
    pub drain_timeout: Option<Duration>,
}

impl TcpClientConfig {
    pub fn new(endpoint: Endpoint) -> TcpClientConfig {
        TcpClientConfig {
            endpoint,
            no_delay: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_queue: WriteQueueConfig::default(),
            drain_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Connects to a TCP peer, mirroring the server-side session on the client side. The
///  client identifier stays the same across disconnect/reconnect cycles; each connection
///  gets its own internal session.
///
/// `connect` and `disconnect` block until the attempt resolved resp. `on_disconnected`
///  fired; from inside callbacks (which run on worker threads) use the `_async` variants
///  instead.
pub struct TcpClient {
    id: Uuid,
    service: Arc<Service>,
    config: TcpClientConfig,
    handler: Arc<dyn ClientHandler>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
}

impl TcpClient {
    pub fn new(
        service: Arc<Service>,
        config: TcpClientConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> TcpClient {
        TcpClient {
            id: Uuid::new_v4(),
            service,
            config,
            handler,
            current: Arc::new(Mutex::new(None)),
            totals: Arc::new(TrafficStats::default()),
            connected_flag: Arc::new(StateFlag::new(false)),
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
        self.current.lock().unwrap().is_some()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        let mut aggregate = self.totals.snapshot();
        if let Some(session) = self.current.lock().unwrap().as_ref() {
            aggregate.merge(session.stats());
        }
        aggregate
    }

    /// Connect and block until the attempt resolved. `on_connected` fires on a worker
    ///  thread once the connection is up; a failed attempt fires `on_error` and returns
    ///  false.
    pub fn connect(&self) -> bool {
        let (tx, rx) = mpsc::channel();
        if !self.spawn_connect(Some(tx)) {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    /// Fire-and-forget connect; the outcome is observable through `on_connected` /
    ///  `on_error`. Safe to call from inside callbacks.
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

    /// Gracefully disconnect and block until `on_disconnected` fired. Must not be called
    ///  from a worker thread.
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

    /// Request a graceful disconnect without waiting. Safe to call from callbacks.
    pub fn disconnect_async(&self) -> bool {
        match self.current.lock().unwrap().as_ref() {
            Some(session) => session.disconnect(),
            None => false,
        }
    }

    /// Disconnect followed by a fresh connect to the same endpoint; the client
    ///  identifier is preserved.
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
    config: TcpClientConfig,
    handler: Arc<dyn ClientHandler>,
    current: Arc<Mutex<Option<Arc<Session>>>>,
    totals: Arc<TrafficStats>,
    connected_flag: Arc<StateFlag>,
    connecting: Arc<AtomicBool>,
    service_shutdown: watch::Receiver<bool>,
}

async fn connect_and_drive(ctx: ConnectContext, result: Option<mpsc::Sender<bool>>) {
    let stream = match TcpStream::connect(ctx.config.endpoint.socket_addr()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(client = %ctx.client_id, "connect to {} failed: {}", ctx.config.endpoint, e);
            ctx.handler.on_error(&ErrorInfo::from_io(&e)).await;
            ctx.connecting.store(false, Ordering::Release);
            if let Some(result) = result {
                let _ = result.send(false);
            }
            return;
        }
    };
    if ctx.config.no_delay {
        let _ = stream.set_nodelay(true);
    }

    let session = Session::new(ctx.client_id, ctx.config.endpoint, ctx.config.write_queue);
    *ctx.current.lock().unwrap() = Some(session.clone());
    ctx.connected_flag.set(true);
    ctx.connecting.store(false, Ordering::Release);
    info!(client = %ctx.client_id, endpoint = %ctx.config.endpoint, "connected");
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
        stream,
        session,
        events,
        ctx.config.chunk_size,
        ctx.config.drain_timeout,
        ctx.service_shutdown,
        None,
    )
    .await;
}
