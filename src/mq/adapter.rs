use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ErrorInfo, CATEGORY_FRAMING};
use crate::mq::frame::{encode_frame, FrameAssembler, MAX_MESSAGE_SIZE};
use crate::session::{ClientHandler, Session, SessionHandler};

/// Message-level callbacks of a framed server. One `on_received` per complete message.
#[async_trait]
pub trait MqServerHandler: Send + Sync + 'static {
    async fn on_connected(&self, _session: &MqSession) {}
    async fn on_received(&self, _session: &MqSession, _message: &[u8]) {}
    async fn on_disconnected(&self, _session: &MqSession) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// Client-side mirror of [MqServerHandler].
#[async_trait]
pub trait MqClientHandler: Send + Sync + 'static {
    async fn on_connected(&self) {}
    async fn on_received(&self, _message: &[u8]) {}
    async fn on_disconnected(&self) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// A byte-stream session viewed through the message framing: `send_message` frames the
///  payload, identities and lifecycle are the underlying session's.
pub struct MqSession {
    inner: Arc<Session>,
}

impl MqSession {
    pub(crate) fn new(inner: Arc<Session>) -> MqSession {
        MqSession { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Returns the payload bytes queued (the length prefix is not counted), 0 on
    ///  failure.
    pub fn send_message(&self, message: &[u8]) -> usize {
        if self.inner.send(&encode_frame(message)) == 0 {
            0
        } else {
            message.len()
        }
    }

    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }
}

/// Byte-stream → message adapter on the server side: reassembles frames per session and
///  forwards complete messages. With `exclusive` set, only one session is admitted at a
///  time; later connections are refused (pair semantics).
pub(crate) struct FramedServerAdapter {
    handler: Arc<dyn MqServerHandler>,
    assemblers: Mutex<FxHashMap<Uuid, FrameAssembler>>,
    exclusive: bool,
    active_peer: Mutex<Option<Uuid>>,
}

impl FramedServerAdapter {
    pub fn new(handler: Arc<dyn MqServerHandler>, exclusive: bool) -> FramedServerAdapter {
        FramedServerAdapter {
            handler,
            assemblers: Mutex::new(FxHashMap::default()),
            exclusive,
            active_peer: Mutex::new(None),
        }
    }

    fn admit(&self, session: &Arc<Session>) -> bool {
        if !self.exclusive {
            return true;
        }
        let mut active = self.active_peer.lock().unwrap();
        match *active {
            Some(_) => false,
            None => {
                *active = Some(session.id());
                true
            }
        }
    }

    pub fn active_peer(&self) -> Option<Uuid> {
        *self.active_peer.lock().unwrap()
    }

    /// true if the session was an admitted peer (as opposed to a refused surplus one)
    fn release(&self, session: &Arc<Session>) -> bool {
        if !self.exclusive {
            return true;
        }
        let mut active = self.active_peer.lock().unwrap();
        if *active == Some(session.id()) {
            *active = None;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl SessionHandler for FramedServerAdapter {
    async fn on_connected(&self, session: &Arc<Session>) {
        if !self.admit(session) {
            warn!(session = %session.id(), "refusing connection: a peer is already paired");
            session.disconnect();
            return;
        }
        self.assemblers
            .lock()
            .unwrap()
            .insert(session.id(), FrameAssembler::new(MAX_MESSAGE_SIZE));
        self.handler.on_connected(&MqSession::new(session.clone())).await;
    }

    async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
        let mut pushed = false;
        loop {
            let frame = {
                let mut assemblers = self.assemblers.lock().unwrap();
                let Some(assembler) = assemblers.get_mut(&session.id()) else { return };
                if !pushed {
                    // push once, then keep draining frames
                    assembler.push(data);
                    pushed = true;
                }
                assembler.next_frame()
            };
            match frame {
                Ok(Some(message)) => {
                    self.handler.on_received(&MqSession::new(session.clone()), &message).await;
                }
                Ok(None) => return,
                Err(e) => {
                    self.handler
                        .on_error(&ErrorInfo::new(-1, CATEGORY_FRAMING, e.to_string()))
                        .await;
                    session.abort();
                    return;
                }
            }
        }
    }

    async fn on_disconnected(&self, session: &Arc<Session>) {
        self.assemblers.lock().unwrap().remove(&session.id());
        if self.release(session) {
            self.handler.on_disconnected(&MqSession::new(session.clone())).await;
        }
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}

/// Client-side framing adapter: one connection, one assembler (reset per connect).
pub(crate) struct FramedClientAdapter {
    handler: Arc<dyn MqClientHandler>,
    assembler: Mutex<FrameAssembler>,
    abort_connection: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FramedClientAdapter {
    pub fn new(handler: Arc<dyn MqClientHandler>) -> FramedClientAdapter {
        FramedClientAdapter {
            handler,
            assembler: Mutex::new(FrameAssembler::new(MAX_MESSAGE_SIZE)),
            abort_connection: Mutex::new(None),
        }
    }

    pub fn set_abort(&self, abort: Box<dyn Fn() + Send + Sync>) {
        *self.abort_connection.lock().unwrap() = Some(abort);
    }
}

#[async_trait]
impl ClientHandler for FramedClientAdapter {
    async fn on_connected(&self) {
        *self.assembler.lock().unwrap() = FrameAssembler::new(MAX_MESSAGE_SIZE);
        self.handler.on_connected().await;
    }

    async fn on_received(&self, data: &[u8]) {
        let mut pushed = false;
        loop {
            let frame = {
                let mut assembler = self.assembler.lock().unwrap();
                if !pushed {
                    assembler.push(data);
                    pushed = true;
                }
                assembler.next_frame()
            };
            match frame {
                Ok(Some(message)) => self.handler.on_received(&message).await,
                Ok(None) => return,
                Err(e) => {
                    self.handler
                        .on_error(&ErrorInfo::new(-1, CATEGORY_FRAMING, e.to_string()))
                        .await;
                    if let Some(abort) = self.abort_connection.lock().unwrap().as_ref() {
                        abort();
                    }
                    return;
                }
            }
        }
    }

    async fn on_disconnected(&self) {
        self.handler.on_disconnected().await;
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}
