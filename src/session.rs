use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{is_transient, ErrorInfo};
use crate::endpoint::Endpoint;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::util::state_flag::StateFlag;
use crate::write_queue::{EnqueueOutcome, WriteQueue, WriteQueueConfig};

/// Receive buffer granularity per read operation.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Server-side callbacks for connection-oriented byte-stream transports (TCP and TLS).
///  All methods default to no-ops. For one session, callbacks never overlap and always
///  follow the sequence `on_connected` → (`on_received` | `on_sent`)* →
///  `on_disconnected`; across sessions there is no ordering guarantee.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connected(&self, _session: &Arc<Session>) {}
    async fn on_received(&self, _session: &Arc<Session>, _data: &[u8]) {}
    /// `sent` is the size of the buffer whose transmission just completed, `pending` the
    ///  bytes still queued behind it.
    async fn on_sent(&self, _session: &Arc<Session>, _sent: usize, _pending: usize) {}
    async fn on_disconnected(&self, _session: &Arc<Session>) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// Client-side mirror of [SessionHandler].
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn on_connected(&self) {}
    async fn on_received(&self, _data: &[u8]) {}
    async fn on_sent(&self, _sent: usize, _pending: usize) {}
    async fn on_disconnected(&self) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// One live peer connection. The owning server's registry holds one handle, the driver
///  task holds another; whichever lets go last releases the session.
pub struct Session {
    id: Uuid,
    /// id of the owning server (or client) - a back-reference by identifier, not by handle
    owner: Uuid,
    peer: Endpoint,
    connected: AtomicBool,
    stats: TrafficStats,
    queue: WriteQueue<Bytes>,
    close_requested: AtomicBool,
    close_graceful: AtomicBool,
    close_notify: Notify,
}

impl Session {
    pub(crate) fn new(owner: Uuid, peer: Endpoint, queue_config: WriteQueueConfig) -> Arc<Session> {
        Arc::new(Session {
            id: Uuid::new_v4(),
            owner,
            peer,
            connected: AtomicBool::new(true),
            stats: TrafficStats::default(),
            queue: WriteQueue::new(queue_config),
            close_requested: AtomicBool::new(false),
            close_graceful: AtomicBool::new(true),
            close_notify: Notify::new(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner
    }

    pub fn peer_endpoint(&self) -> Endpoint {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    pub fn pending_bytes(&self) -> usize {
        self.queue.pending_bytes()
    }

    /// Append to the write queue; the driver posts the actual write. Returns the number
    ///  of bytes queued, 0 when the session is disconnected or the queue rejected the
    ///  buffer.
    pub fn send(&self, data: &[u8]) -> usize {
        if data.is_empty() || !self.is_connected() {
            return 0;
        }
        match self.queue.enqueue(Bytes::copy_from_slice(data), data.len()) {
            EnqueueOutcome::Queued(n) => n,
            EnqueueOutcome::Dropped => {
                trace!(session = %self.id, "write queue full, dropping buffer");
                0
            }
            EnqueueOutcome::Overflow => {
                warn!(session = %self.id, "write queue overflow, disconnecting");
                self.disconnect();
                0
            }
        }
    }

    /// Initiate a graceful close: stop reading, drain queued writes up to the configured
    ///  deadline, then shut the socket down. Returns false if the session is already
    ///  disconnected or a close is already under way.
    pub fn disconnect(&self) -> bool {
        self.request_close(true)
    }

    /// Close without draining queued writes.
    pub fn abort(&self) -> bool {
        self.request_close(false)
    }

    fn request_close(&self, graceful: bool) -> bool {
        if !self.is_connected() || self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_graceful.store(graceful, Ordering::Release);
        self.close_notify.notify_one();
        true
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// The mutex-protected map of live sessions of one server. Insertion happens on accept,
///  removal after `on_disconnected` returned. Generic so the frame-oriented transports
///  can register their own session types.
pub(crate) struct SessionRegistry<S> {
    sessions: Mutex<FxHashMap<Uuid, Arc<S>>>,
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Arc<SessionRegistry<S>> {
        Arc::new(SessionRegistry {
            sessions: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn insert(&self, id: Uuid, session: Arc<S>) {
        self.sessions.lock().unwrap().insert(id, session);
    }

    pub fn remove(&self, id: Uuid) {
        self.sessions.lock().unwrap().remove(&id);
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<S>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<S>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }
}

/// Internal seam between the transport-agnostic driver loop and the context it runs in
///  (server session vs. client connection).
#[async_trait]
pub(crate) trait SessionEvents: Send + Sync {
    async fn on_connected(&self);
    async fn on_received(&self, data: &[u8]);
    async fn on_sent(&self, sent: usize, pending: usize);
    async fn on_disconnected(&self);
    async fn on_error(&self, error: &ErrorInfo);
}

pub(crate) struct ServerSessionEvents {
    pub session: Arc<Session>,
    pub handler: Arc<dyn SessionHandler>,
    pub registry: Arc<SessionRegistry<Session>>,
    pub totals: Arc<TrafficStats>,
}

#[async_trait]
impl SessionEvents for ServerSessionEvents {
    async fn on_connected(&self) {
        self.handler.on_connected(&self.session).await;
    }

    async fn on_received(&self, data: &[u8]) {
        self.handler.on_received(&self.session, data).await;
    }

    async fn on_sent(&self, sent: usize, pending: usize) {
        self.handler.on_sent(&self.session, sent, pending).await;
    }

    async fn on_disconnected(&self) {
        self.handler.on_disconnected(&self.session).await;
        // deregistration strictly after the callback returned
        self.registry.remove(self.session.id());
        self.totals.absorb(self.session.stats());
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}

pub(crate) struct ClientSessionEvents {
    pub session: Arc<Session>,
    pub handler: Arc<dyn ClientHandler>,
    pub current: Arc<Mutex<Option<Arc<Session>>>>,
    pub totals: Arc<TrafficStats>,
    pub connected_flag: Arc<StateFlag>,
}

#[async_trait]
impl SessionEvents for ClientSessionEvents {
    async fn on_connected(&self) {
        self.handler.on_connected().await;
    }

    async fn on_received(&self, data: &[u8]) {
        self.handler.on_received(data).await;
    }

    async fn on_sent(&self, sent: usize, pending: usize) {
        self.handler.on_sent(sent, pending).await;
    }

    async fn on_disconnected(&self) {
        self.handler.on_disconnected().await;
        *self.current.lock().unwrap() = None;
        self.totals.absorb(self.session.stats());
        self.connected_flag.set(false);
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}

async fn shut_down(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            let _ = rx.wait_for(|v| *v).await;
        }
        None => std::future::pending().await,
    }
}

/// The per-session driver: a single task owning both directions of the stream, which is
///  what serializes all callbacks of one session. A read of up to `chunk_size` bytes is
///  always pending; at most one write is in flight, fed from the session's write queue.
///
/// Exits on: peer close (zero-length read), fatal I/O error, a requested close, the
///  owning server's stop signal (graceful), or the service's stop signal (no drain).
pub(crate) async fn drive_stream<S>(
    stream: S,
    session: Arc<Session>,
    events: Arc<dyn SessionEvents>,
    chunk_size: usize,
    drain_timeout: Option<Duration>,
    mut service_shutdown: watch::Receiver<bool>,
    mut owner_shutdown: Option<watch::Receiver<bool>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    events.on_connected().await;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = vec![0u8; chunk_size];
    let mut drain = false;

    loop {
        tokio::select! {
            _ = async { let _ = service_shutdown.wait_for(|v| *v).await; } => {
                // service stop cancels pending work; queued writes are not drained
                break;
            }
            _ = shut_down(&mut owner_shutdown) => {
                drain = true;
                break;
            }
            _ = session.close_notify.notified() => {
                drain = session.close_graceful.load(Ordering::Acquire);
                break;
            }
            read = reader.read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        debug!(session = %session.id, "peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        session.stats.add_received(n);
                        events.on_received(&read_buf[..n]).await;
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) => {
                        events.on_error(&ErrorInfo::from_io(&e)).await;
                        break;
                    }
                }
            }
            (buf, byte_len) = session.queue.next() => {
                match writer.write_all(&buf).await {
                    Ok(()) => {
                        session.stats.add_sent(byte_len);
                        events.on_sent(byte_len, session.queue.pending_bytes()).await;
                    }
                    Err(e) => {
                        events.on_error(&ErrorInfo::from_io(&e)).await;
                        drain = false;
                        break;
                    }
                }
            }
        }
    }

    if drain && !session.queue.is_empty() {
        let deadline = drain_timeout.map(|t| Instant::now() + t);
        while let Some((buf, byte_len)) = session.queue.try_next() {
            let result = match deadline {
                Some(deadline) => match timeout_at(deadline, writer.write_all(&buf)).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(session = %session.id, "drain deadline reached, discarding {} queued bytes",
                            byte_len + session.queue.pending_bytes());
                        break;
                    }
                },
                None => writer.write_all(&buf).await,
            };
            match result {
                Ok(()) => {
                    session.stats.add_sent(byte_len);
                    events.on_sent(byte_len, session.queue.pending_bytes()).await;
                }
                Err(_) => break,
            }
        }
    }

    // both directions; for TLS this is where close_notify goes out
    let _ = writer.shutdown().await;
    session.mark_disconnected();
    events.on_disconnected().await;
}
