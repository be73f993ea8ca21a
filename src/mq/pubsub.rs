use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::error::ErrorInfo;
use crate::mq::adapter::{
    FramedClientAdapter, FramedServerAdapter, MqClientHandler, MqServerHandler, MqSession,
};
use crate::mq::frame::encode_frame;
use crate::service::Service;
use crate::stats::TrafficSnapshot;
use crate::tcp::{TcpClient, TcpClientConfig, TcpServer, TcpServerConfig};

const KIND_DATA: u8 = 0;
const KIND_SUBSCRIBE: u8 = 1;
const KIND_UNSUBSCRIBE: u8 = 2;

/// The message body inside a pub/sub frame: one kind byte, then topic (and payload for
///  data messages). Subscriptions are topic *prefixes*.
enum PubSubMessage {
    Data { topic: Bytes, payload: Bytes },
    Subscribe { topic: Bytes },
    Unsubscribe { topic: Bytes },
}

impl PubSubMessage {
    fn ser(&self, buf: &mut BytesMut) {
        match self {
            PubSubMessage::Data { topic, payload } => {
                buf.put_u8(KIND_DATA);
                buf.put_u16(topic.len() as u16);
                buf.put_slice(topic);
                buf.put_slice(payload);
            }
            PubSubMessage::Subscribe { topic } => {
                buf.put_u8(KIND_SUBSCRIBE);
                buf.put_slice(topic);
            }
            PubSubMessage::Unsubscribe { topic } => {
                buf.put_u8(KIND_UNSUBSCRIBE);
                buf.put_slice(topic);
            }
        }
    }

    fn deser(mut buf: &[u8]) -> anyhow::Result<PubSubMessage> {
        if !buf.has_remaining() {
            bail!("empty pub/sub message");
        }
        match buf.get_u8() {
            KIND_DATA => {
                if buf.remaining() < 2 {
                    bail!("truncated data message");
                }
                let topic_len = buf.get_u16() as usize;
                if buf.remaining() < topic_len {
                    bail!("truncated data message topic");
                }
                let topic = Bytes::copy_from_slice(&buf[..topic_len]);
                buf.advance(topic_len);
                Ok(PubSubMessage::Data {
                    topic,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            KIND_SUBSCRIBE => Ok(PubSubMessage::Subscribe {
                topic: Bytes::copy_from_slice(buf),
            }),
            KIND_UNSUBSCRIBE => Ok(PubSubMessage::Unsubscribe {
                topic: Bytes::copy_from_slice(buf),
            }),
            kind => bail!("unknown pub/sub message kind: {}", kind),
        }
    }

    fn into_frame(self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        encode_frame(&buf)
    }
}

/// Callbacks of a [PublishServer]; subscribers never push data, so there is no
///  `on_received`.
#[async_trait]
pub trait PublishServerHandler: Send + Sync + 'static {
    async fn on_connected(&self, _subscriber: &MqSession) {}
    async fn on_subscribed(&self, _subscriber: &MqSession, _topic: &[u8]) {}
    async fn on_unsubscribed(&self, _subscriber: &MqSession, _topic: &[u8]) {}
    async fn on_disconnected(&self, _subscriber: &MqSession) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// Topic-based fan-out: subscribers register topic prefixes, `publish` delivers one
///  message to every session whose subscription prefix-matches the topic. Messages with
///  no matching subscriber are dropped silently.
pub struct PublishServer {
    server: TcpServer,
    subscriptions: Arc<SubscriptionTable>,
}

impl PublishServer {
    pub fn new(
        service: Arc<Service>,
        config: TcpServerConfig,
        handler: Arc<dyn PublishServerHandler>,
    ) -> PublishServer {
        let subscriptions = Arc::new(SubscriptionTable::default());
        let adapter = Arc::new(FramedServerAdapter::new(
            Arc::new(SubscriptionAdapter {
                handler,
                subscriptions: subscriptions.clone(),
            }),
            false,
        ));
        PublishServer {
            server: TcpServer::new(service, config, adapter),
            subscriptions,
        }
    }

    pub fn id(&self) -> Uuid {
        self.server.id()
    }

    pub fn is_started(&self) -> bool {
        self.server.is_started()
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.server.local_endpoint()
    }

    pub fn connected_subscribers(&self) -> usize {
        self.server.connected_sessions()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.server.stats()
    }

    pub fn start(&self) -> bool {
        self.server.start()
    }

    pub fn stop(&self) -> bool {
        self.server.stop()
    }

    pub fn restart(&self) -> bool {
        self.server.restart()
    }

    /// Deliver one message to every matching subscriber; returns how many sessions it
    ///  was queued on.
    pub fn publish(&self, topic: &[u8], payload: &[u8]) -> usize {
        if !self.is_started() {
            return 0;
        }
        let frame = PubSubMessage::Data {
            topic: Bytes::copy_from_slice(topic),
            payload: Bytes::copy_from_slice(payload),
        }
        .into_frame();

        let mut reached = 0;
        for session_id in self.subscriptions.matching(topic) {
            if let Some(session) = self.server.session(session_id) {
                if session.send(&frame) > 0 {
                    reached += 1;
                }
            }
        }
        reached
    }
}

#[derive(Default)]
struct SubscriptionTable {
    by_session: Mutex<FxHashMap<Uuid, Vec<Bytes>>>,
}

impl SubscriptionTable {
    fn matching(&self, topic: &[u8]) -> Vec<Uuid> {
        self.by_session
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, prefixes)| prefixes.iter().any(|p| topic.starts_with(p.as_ref())))
            .map(|(id, _)| *id)
            .collect()
    }
}

struct SubscriptionAdapter {
    handler: Arc<dyn PublishServerHandler>,
    subscriptions: Arc<SubscriptionTable>,
}

#[async_trait]
impl MqServerHandler for SubscriptionAdapter {
    async fn on_connected(&self, session: &MqSession) {
        self.subscriptions
            .by_session
            .lock()
            .unwrap()
            .insert(session.id(), Vec::new());
        self.handler.on_connected(session).await;
    }

    async fn on_received(&self, session: &MqSession, message: &[u8]) {
        match PubSubMessage::deser(message) {
            Ok(PubSubMessage::Subscribe { topic }) => {
                debug!(session = %session.id(), topic = ?topic, "subscription added");
                {
                    let mut by_session = self.subscriptions.by_session.lock().unwrap();
                    if let Some(prefixes) = by_session.get_mut(&session.id()) {
                        if !prefixes.contains(&topic) {
                            prefixes.push(topic.clone());
                        }
                    }
                }
                self.handler.on_subscribed(session, &topic).await;
            }
            Ok(PubSubMessage::Unsubscribe { topic }) => {
                {
                    let mut by_session = self.subscriptions.by_session.lock().unwrap();
                    if let Some(prefixes) = by_session.get_mut(&session.id()) {
                        prefixes.retain(|p| p != &topic);
                    }
                }
                self.handler.on_unsubscribed(session, &topic).await;
            }
            Ok(PubSubMessage::Data { .. }) => {
                warn!(session = %session.id(), "subscriber tried to publish, ignoring");
            }
            Err(e) => {
                warn!(session = %session.id(), "unparseable pub/sub message: {}", e);
                session.disconnect();
            }
        }
    }

    async fn on_disconnected(&self, session: &MqSession) {
        self.subscriptions.by_session.lock().unwrap().remove(&session.id());
        self.handler.on_disconnected(session).await;
    }

    async fn on_error(&self, error: &ErrorInfo) {
        self.handler.on_error(error).await;
    }
}

/// Callbacks of a [SubscribeClient]; data messages arrive with their topic split out.
#[async_trait]
pub trait SubscriberHandler: Send + Sync + 'static {
    async fn on_connected(&self) {}
    async fn on_received(&self, _topic: &[u8], _payload: &[u8]) {}
    async fn on_disconnected(&self) {}
    async fn on_error(&self, _error: &ErrorInfo) {}
}

/// Subscribing client: connect, `subscribe` to topic prefixes, receive matching
///  messages. Subscriptions do not survive a reconnect - resubscribe from
///  `on_connected`.
pub struct SubscribeClient {
    client: Arc<TcpClient>,
}

impl SubscribeClient {
    pub fn new(
        service: Arc<Service>,
        config: TcpClientConfig,
        handler: Arc<dyn SubscriberHandler>,
    ) -> SubscribeClient {
        let adapter = Arc::new(FramedClientAdapter::new(Arc::new(SubscriberAdapter { handler })));
        let client = Arc::new(TcpClient::new(service, config, adapter.clone()));
        let weak = Arc::downgrade(&client);
        adapter.set_abort(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.disconnect_async();
            }
        }));
        SubscribeClient { client }
    }

    pub fn id(&self) -> Uuid {
        self.client.id()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.client.stats()
    }

    pub fn connect(&self) -> bool {
        self.client.connect()
    }

    pub fn connect_async(&self) -> bool {
        self.client.connect_async()
    }

    pub fn disconnect(&self) -> bool {
        self.client.disconnect()
    }

    pub fn disconnect_async(&self) -> bool {
        self.client.disconnect_async()
    }

    pub fn reconnect(&self) -> bool {
        self.client.reconnect()
    }

    /// Register a topic prefix with the server.
    pub fn subscribe(&self, topic: &[u8]) -> bool {
        self.send_control(PubSubMessage::Subscribe {
            topic: Bytes::copy_from_slice(topic),
        })
    }

    pub fn unsubscribe(&self, topic: &[u8]) -> bool {
        self.send_control(PubSubMessage::Unsubscribe {
            topic: Bytes::copy_from_slice(topic),
        })
    }

    fn send_control(&self, message: PubSubMessage) -> bool {
        self.client.send(&message.into_frame()) > 0
    }
}

struct SubscriberAdapter {
    handler: Arc<dyn SubscriberHandler>,
}

#[async_trait]
impl MqClientHandler for SubscriberAdapter {
    async fn on_connected(&self) {
        self.handler.on_connected().await;
    }

    async fn on_received(&self, message: &[u8]) {
        match PubSubMessage::deser(message) {
            Ok(PubSubMessage::Data { topic, payload }) => {
                self.handler.on_received(&topic, &payload).await;
            }
            Ok(_) => {
                warn!("unexpected control message from publisher, ignoring");
            }
            Err(e) => {
                warn!("unparseable pub/sub message: {}", e);
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
