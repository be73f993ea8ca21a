mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netserver::mq::{
    MqClientHandler, MqServerHandler, MqSession, PairClient, PairServer, PublishServer,
    PublishServerHandler, RequestClient, RequestServer, SubscribeClient, SubscriberHandler,
};
use netserver::tcp::{TcpClientConfig, TcpServerConfig};

use common::{localhost, start_service, wait_until, WAIT};

#[derive(Default)]
struct RecordingMqServerHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    messages: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MqServerHandler for RecordingMqServerHandler {
    async fn on_connected(&self, _session: &MqSession) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, _session: &MqSession, message: &[u8]) {
        self.messages.lock().unwrap().push(message.to_vec());
    }

    async fn on_disconnected(&self, _session: &MqSession) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingMqClientHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    messages: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MqClientHandler for RecordingMqClientHandler {
    async fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, message: &[u8]) {
        self.messages.lock().unwrap().push(message.to_vec());
    }

    async fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_pair_exchanges_messages_both_ways() {
    let service = start_service();

    let server_handler = Arc::new(RecordingMqServerHandler::default());
    let server = PairServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        server_handler.clone(),
    );
    assert!(server.start());

    let client_handler = Arc::new(RecordingMqClientHandler::default());
    let client = PairClient::new(
        service.clone(),
        TcpClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    );
    assert!(client.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    assert_eq!(client.send_message(b"from client"), 11);
    assert!(wait_until(WAIT, || server_handler.messages.lock().unwrap().len() == 1));
    assert_eq!(server_handler.messages.lock().unwrap()[0], b"from client");

    assert_eq!(server.send_message(b"from server"), 11);
    assert!(wait_until(WAIT, || client_handler.messages.lock().unwrap().len() == 1));
    assert_eq!(client_handler.messages.lock().unwrap()[0], b"from server");

    service.stop();
}

#[test]
fn test_pair_refuses_a_second_peer() {
    let service = start_service();

    let server_handler = Arc::new(RecordingMqServerHandler::default());
    let server = PairServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        server_handler.clone(),
    );
    assert!(server.start());
    let endpoint = server.local_endpoint().unwrap();

    let first_handler = Arc::new(RecordingMqClientHandler::default());
    let first = PairClient::new(service.clone(), TcpClientConfig::new(endpoint), first_handler.clone());
    assert!(first.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    // the TCP connect succeeds but the server hangs up on the surplus peer
    let second_handler = Arc::new(RecordingMqClientHandler::default());
    let second = PairClient::new(service.clone(), TcpClientConfig::new(endpoint), second_handler.clone());
    assert!(second.connect());
    assert!(wait_until(WAIT, || second_handler.disconnected.load(Ordering::SeqCst) == 1));
    assert_eq!(server_handler.connected.load(Ordering::SeqCst), 1);
    assert!(first.is_connected());

    // once the paired peer leaves, a new one is admitted
    assert!(first.disconnect());
    assert!(wait_until(WAIT, || server_handler.disconnected.load(Ordering::SeqCst) == 1));
    assert!(second.reconnect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 2));

    service.stop();
}

/// Replies to every request with "re:" + request.
#[derive(Default)]
struct ReplyingHandler {
    requests: AtomicUsize,
}

#[async_trait]
impl MqServerHandler for ReplyingHandler {
    async fn on_received(&self, session: &MqSession, message: &[u8]) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut reply = b"re:".to_vec();
        reply.extend_from_slice(message);
        session.send_message(&reply);
    }
}

#[test]
fn test_request_reply() {
    let service = start_service();

    let server_handler = Arc::new(ReplyingHandler::default());
    let server = RequestServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        server_handler.clone(),
    );
    assert!(server.start());

    let client_handler = Arc::new(RecordingMqClientHandler::default());
    let client = RequestClient::new(
        service.clone(),
        TcpClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    );
    assert!(client.connect());

    assert_eq!(client.request(b"hello"), 5);
    assert_eq!(client.request(b"world"), 5);
    assert!(wait_until(WAIT, || client_handler.messages.lock().unwrap().len() == 2));

    let replies = client_handler.messages.lock().unwrap();
    assert_eq!(replies[0], b"re:hello");
    assert_eq!(replies[1], b"re:world");
    drop(replies);
    assert_eq!(server_handler.requests.load(Ordering::SeqCst), 2);

    service.stop();
}

#[derive(Default)]
struct RecordingPublishHandler {
    subscribed: AtomicUsize,
    unsubscribed: AtomicUsize,
}

#[async_trait]
impl PublishServerHandler for RecordingPublishHandler {
    async fn on_subscribed(&self, _subscriber: &MqSession, _topic: &[u8]) {
        self.subscribed.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_unsubscribed(&self, _subscriber: &MqSession, _topic: &[u8]) {
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingSubscriberHandler {
    messages: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
}

#[async_trait]
impl SubscriberHandler for RecordingSubscriberHandler {
    async fn on_received(&self, topic: &[u8], payload: &[u8]) {
        self.messages.lock().unwrap().push((topic.to_vec(), payload.to_vec()));
    }
}

#[test]
fn test_publish_subscribe_fan_out_by_topic_prefix() {
    let service = start_service();

    let publish_handler = Arc::new(RecordingPublishHandler::default());
    let server = PublishServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        publish_handler.clone(),
    );
    assert!(server.start());
    let endpoint = server.local_endpoint().unwrap();

    let sensors = Arc::new(RecordingSubscriberHandler::default());
    let sensor_client = SubscribeClient::new(service.clone(), TcpClientConfig::new(endpoint), sensors.clone());
    assert!(sensor_client.connect());
    assert!(sensor_client.subscribe(b"sensor/"));

    let logs = Arc::new(RecordingSubscriberHandler::default());
    let log_client = SubscribeClient::new(service.clone(), TcpClientConfig::new(endpoint), logs.clone());
    assert!(log_client.connect());
    assert!(log_client.subscribe(b"log/"));

    assert!(wait_until(WAIT, || publish_handler.subscribed.load(Ordering::SeqCst) == 2));

    assert_eq!(server.publish(b"sensor/temp", b"42"), 1);
    assert_eq!(server.publish(b"log/app", b"starting"), 1);
    assert_eq!(server.publish(b"other/x", b"dropped"), 0);

    assert!(wait_until(WAIT, || sensors.messages.lock().unwrap().len() == 1));
    assert!(wait_until(WAIT, || logs.messages.lock().unwrap().len() == 1));
    assert_eq!(
        sensors.messages.lock().unwrap()[0],
        (b"sensor/temp".to_vec(), b"42".to_vec())
    );
    assert_eq!(
        logs.messages.lock().unwrap()[0],
        (b"log/app".to_vec(), b"starting".to_vec())
    );

    // unsubscribing stops delivery
    assert!(sensor_client.unsubscribe(b"sensor/"));
    assert!(wait_until(WAIT, || publish_handler.unsubscribed.load(Ordering::SeqCst) == 1));
    assert_eq!(server.publish(b"sensor/temp", b"43"), 0);
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(sensors.messages.lock().unwrap().len(), 1);

    service.stop();
}
