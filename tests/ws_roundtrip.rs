mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netserver::ws::{
    Message, WsClient, WsClientConfig, WsClientHandler, WsServer, WsServerConfig, WsSession,
    WsSessionHandler,
};

use common::{localhost, start_service, wait_until, WAIT};

/// Replies to the text frame "ping" with the binary frame [0x01, 0x02].
#[derive(Default)]
struct PingServerHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    closes: Mutex<Vec<(u16, String)>>,
    text_frames: Mutex<Vec<String>>,
}

#[async_trait]
impl WsSessionHandler for PingServerHandler {
    async fn on_connected(&self, _session: &Arc<WsSession>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, session: &Arc<WsSession>, message: &Message) {
        if let Message::Text(text) = message {
            self.text_frames.lock().unwrap().push(text.clone());
            if text == "ping" {
                session.send(&[0x01, 0x02]);
            }
        }
    }

    async fn on_close(&self, _session: &Arc<WsSession>, code: u16, reason: &str) {
        self.closes.lock().unwrap().push((code, reason.to_owned()));
    }

    async fn on_disconnected(&self, _session: &Arc<WsSession>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingWsClientHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    binary_frames: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl WsClientHandler for RecordingWsClientHandler {
    async fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, message: &Message) {
        if let Message::Binary(payload) = message {
            self.binary_frames.lock().unwrap().push(payload.clone());
        }
    }

    async fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_text_request_binary_reply() {
    let service = start_service();

    let server_handler = Arc::new(PingServerHandler::default());
    let server = WsServer::new(
        service.clone(),
        WsServerConfig::new(localhost(0)),
        server_handler.clone(),
    )
    .unwrap();
    assert!(server.start());

    let client_handler = Arc::new(RecordingWsClientHandler::default());
    let client = WsClient::new(
        service.clone(),
        WsClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    )
    .unwrap();
    assert!(client.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    assert_eq!(client.send_text("ping"), 4);
    assert!(wait_until(WAIT, || !client_handler.binary_frames.lock().unwrap().is_empty()));

    // the server saw one complete text frame, the client one binary frame of length 2
    assert_eq!(server_handler.text_frames.lock().unwrap().as_slice(), ["ping"]);
    let frames = client_handler.binary_frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0], vec![0x01, 0x02]);
    drop(frames);

    assert_eq!(server.stats().messages_received, 1);
    assert_eq!(server.stats().bytes_received, 4);
    assert_eq!(server.stats().bytes_sent, 2);

    service.stop();
}

#[test]
fn test_close_frame_carries_code_and_reason() {
    let service = start_service();

    let server_handler = Arc::new(PingServerHandler::default());
    let server = WsServer::new(
        service.clone(),
        WsServerConfig::new(localhost(0)),
        server_handler.clone(),
    )
    .unwrap();
    assert!(server.start());

    let client_handler = Arc::new(RecordingWsClientHandler::default());
    let client = WsClient::new(
        service.clone(),
        WsClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    )
    .unwrap();
    assert!(client.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    assert!(client.disconnect_with(1000, "done"));
    assert_eq!(client_handler.disconnected.load(Ordering::SeqCst), 1);

    assert!(wait_until(WAIT, || server_handler.disconnected.load(Ordering::SeqCst) == 1));
    let closes = server_handler.closes.lock().unwrap();
    assert_eq!(closes.as_slice(), [(1000, "done".to_owned())]);

    service.stop();
}

#[test]
fn test_broadcast_binary_frames() {
    let service = start_service();

    let server_handler = Arc::new(PingServerHandler::default());
    let server = WsServer::new(
        service.clone(),
        WsServerConfig::new(localhost(0)),
        server_handler.clone(),
    )
    .unwrap();
    assert!(server.start());

    let mut clients = Vec::new();
    for _ in 0..2 {
        let handler = Arc::new(RecordingWsClientHandler::default());
        let client = WsClient::new(
            service.clone(),
            WsClientConfig::new(server.local_endpoint().unwrap()),
            handler.clone(),
        )
        .unwrap();
        assert!(client.connect());
        clients.push((client, handler));
    }
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 2));

    assert!(server.broadcast(&[9, 9, 9]));
    for (_, handler) in &clients {
        assert!(wait_until(WAIT, || handler.binary_frames.lock().unwrap().len() == 1));
        assert_eq!(handler.binary_frames.lock().unwrap()[0], vec![9, 9, 9]);
    }

    service.stop();
}
