use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::session::SessionRegistry;
use crate::stats::{TrafficSnapshot, TrafficStats};
use crate::util::state_flag::StateFlag;
use crate::write_queue::{EnqueueOutcome, WriteQueue, WriteQueueConfig};

/// Server-side callbacks of a WebSocket server. `on_received` fires once per complete
///  data frame (text or binary); ping/pong are answered by the framing layer and not
///  surfaced. An incoming close frame fires `on_close` with the peer-supplied code and
///  reason before the regular disconnect path runs.
#[async_trait]
pub trait WsSessionHandler: Send + Sync + 'static {
    async fn on_connected(&self, _session: &Arc<WsSession>) {}
    async fn on_received(&self, _session: &Arc<WsSession>, _message: &Message) {}
    async fn on_sent(&self, _session: &Arc<WsSession>, _sent: usize, _pending: usize) {}
    async fn on_close(&self, _session: &Arc<WsSession>, _code: u16, _reason: &str) {}
    async fn on_disconnected(&self, _session: &Arc<WsSession>) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// One live WebSocket connection. Like the byte-stream session, but the write queue
///  holds complete frames and `send` chooses the opcode: binary for byte buffers, text
///  for strings.
pub struct WsSession {
    id: Uuid,
    owner: Uuid,
    peer: Endpoint,
    connected: AtomicBool,
    stats: TrafficStats,
    queue: WriteQueue<Message>,
    close_requested: AtomicBool,
    close_frame: Mutex<Option<CloseFrame<'static>>>,
    close_notify: Notify,
}

impl WsSession {
    pub(crate) fn new(owner: Uuid, peer: Endpoint, queue_config: WriteQueueConfig) -> Arc<WsSession> {
        Arc::new(WsSession {
            id: Uuid::new_v4(),
            owner,
            peer,
            connected: AtomicBool::new(true),
            stats: TrafficStats::default(),
            queue: WriteQueue::new(queue_config),
            close_requested: AtomicBool::new(false),
            close_frame: Mutex::new(None),
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

    /// Queue one binary frame. Returns the payload bytes queued, 0 on failure.
    pub fn send(&self, data: &[u8]) -> usize {
        self.send_frame(Message::Binary(data.to_vec()))
    }

    /// Queue one text frame.
    pub fn send_text(&self, text: &str) -> usize {
        self.send_frame(Message::Text(text.to_owned()))
    }

    pub fn send_frame(&self, message: Message) -> usize {
        if !self.is_connected() {
            return 0;
        }
        let byte_len = message.len();
        match self.queue.enqueue(message, byte_len) {
            EnqueueOutcome::Queued(n) => n,
            EnqueueOutcome::Dropped => 0,
            EnqueueOutcome::Overflow => {
                self.disconnect(CloseCode::Again.into(), "write queue overflow");
                0
            }
        }
    }

    /// Send a close frame with the given code and reason, then await the peer's close or
    ///  a timeout.
    pub fn disconnect(&self, code: u16, reason: &str) -> bool {
        if !self.is_connected() || self.close_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.close_frame.lock().unwrap() = Some(CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_owned()),
        });
        self.close_notify.notify_one();
        true
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }
}

/// Internal seam between the frame driver and its context (server session vs. client).
#[async_trait]
pub(crate) trait WsEvents: Send + Sync {
    async fn on_connected(&self);
    async fn on_received(&self, message: &Message);
    async fn on_sent(&self, sent: usize, pending: usize);
    async fn on_close(&self, code: u16, reason: &str);
    async fn on_disconnected(&self);
    async fn on_error(&self, error: &ErrorInfo);
}

pub(crate) struct WsServerSessionEvents {
    pub session: Arc<WsSession>,
    pub handler: Arc<dyn WsSessionHandler>,
    pub registry: Arc<SessionRegistry<WsSession>>,
    pub totals: Arc<TrafficStats>,
}

#[async_trait]
impl WsEvents for WsServerSessionEvents {
    async fn on_connected(&self) {
        self.handler.on_connected(&self.session).await;
    }

    async fn on_received(&self, message: &Message) {
        self.handler.on_received(&self.session, message).await;
    }

    async fn on_sent(&self, sent: usize, pending: usize) {
        self.handler.on_sent(&self.session, sent, pending).await;
    }

    async fn on_close(&self, code: u16, reason: &str) {
        self.handler.on_close(&self.session, code, reason).await;
    }

    async fn on_disconnected(&self) {
        self.handler.on_disconnected(&self.session).await;
        self.registry.remove(self.session.id());
        self.totals.absorb(self.session.stats());
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}

pub(crate) struct WsClientSessionEvents {
    pub session: Arc<WsSession>,
    pub handler: Arc<dyn crate::ws::client::WsClientHandler>,
    pub current: Arc<Mutex<Option<Arc<WsSession>>>>,
    pub totals: Arc<TrafficStats>,
    pub connected_flag: Arc<StateFlag>,
}

#[async_trait]
impl WsEvents for WsClientSessionEvents {
    async fn on_connected(&self) {
        self.handler.on_connected().await;
    }

    async fn on_received(&self, message: &Message) {
        self.handler.on_received(message).await;
    }

    async fn on_sent(&self, sent: usize, pending: usize) {
        self.handler.on_sent(sent, pending).await;
    }

    async fn on_close(&self, code: u16, reason: &str) {
        self.handler.on_close(code, reason).await;
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

/// The per-connection frame driver, mirror of the byte-stream driver: one task owning
///  sink and stream, serialized callbacks, one frame in flight at most.
pub(crate) async fn drive_ws<S>(
    ws: WebSocketStream<S>,
    session: Arc<WsSession>,
    events: Arc<dyn WsEvents>,
    close_timeout: Duration,
    mut service_shutdown: watch::Receiver<bool>,
    mut owner_shutdown: Option<watch::Receiver<bool>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    events.on_connected().await;

    let (mut sink, mut stream) = ws.split();
    let mut close_sent = false;

    loop {
        tokio::select! {
            _ = async { let _ = service_shutdown.wait_for(|v| *v).await; } => {
                break;
            }
            _ = shut_down(&mut owner_shutdown) => {
                let _ = sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: Cow::Borrowed("server shutting down"),
                }))).await;
                close_sent = true;
                break;
            }
            _ = session.close_notify.notified() => {
                let frame = session.close_frame.lock().unwrap().take();
                let _ = sink.send(Message::Close(frame)).await;
                close_sent = true;
                break;
            }
            next = stream.next() => {
                match next {
                    None => {
                        debug!(session = %session.id, "peer closed the connection");
                        break;
                    }
                    Some(Ok(message)) => {
                        match &message {
                            Message::Text(_) | Message::Binary(_) => {
                                session.stats.add_received(message.len());
                                events.on_received(&message).await;
                            }
                            Message::Ping(_) | Message::Pong(_) => {
                                // answered/consumed by the framing layer
                                trace!(session = %session.id, "control frame");
                            }
                            Message::Close(frame) => {
                                let (code, reason) = match frame {
                                    Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                                    None => (u16::from(CloseCode::Normal), String::new()),
                                };
                                debug!(session = %session.id, code, "peer sent close frame");
                                events.on_close(code, &reason).await;
                                break;
                            }
                            Message::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        events.on_error(&ErrorInfo::websocket(e.to_string())).await;
                        break;
                    }
                }
            }
            (message, byte_len) = session.queue.next() => {
                match sink.send(message).await {
                    Ok(()) => {
                        session.stats.add_sent(byte_len);
                        events.on_sent(byte_len, session.queue.pending_bytes()).await;
                    }
                    Err(e) => {
                        events.on_error(&ErrorInfo::websocket(e.to_string())).await;
                        break;
                    }
                }
            }
        }
    }

    if close_sent {
        // RFC 6455 close handshake: give the peer a chance to mirror the close frame
        let _ = timeout(close_timeout, async {
            while let Some(Ok(message)) = stream.next().await {
                if let Message::Close(_) = message {
                    break;
                }
            }
        })
        .await;
    }
    let _ = sink.close().await;
    session.mark_disconnected();
    events.on_disconnected().await;
}
