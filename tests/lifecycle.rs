mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netserver::service::{Service, ServiceConfig, ServiceHandler, ServiceState};
use netserver::session::{ClientHandler, Session, SessionHandler};
use netserver::tcp::{TcpClient, TcpClientConfig, TcpServer, TcpServerConfig};

use common::{localhost, start_service, wait_until, WAIT};

struct EventLog {
    events: Mutex<Vec<&'static str>>,
}

impl EventLog {
    fn new() -> EventLog {
        EventLog {
            events: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, event: &'static str) {
        self.events.lock().unwrap().push(event);
    }

    fn snapshot(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }
}

impl ServiceHandler for EventLog {
    fn on_started(&self) {
        self.push("started");
    }
    fn on_stopped(&self) {
        self.push("stopped");
    }
}

#[test]
fn test_service_restart_cycles_fire_hooks_in_order() {
    let log = Arc::new(EventLog::new());
    let service = Service::with_handler(ServiceConfig::default(), log.clone());

    for _ in 0..2 {
        assert!(service.start(false));
        assert_eq!(service.state(), ServiceState::Started);
        assert!(service.stop());
        assert_eq!(service.state(), ServiceState::Stopped);
    }

    assert_eq!(log.snapshot(), vec!["started", "stopped", "started", "stopped"]);
}

#[derive(Default)]
struct CountingSessionHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl SessionHandler for CountingSessionHandler {
    async fn on_connected(&self, _session: &Arc<Session>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_disconnected(&self, _session: &Arc<Session>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingClientHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

#[async_trait]
impl ClientHandler for CountingClientHandler {
    async fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_client_reconnect_preserves_identity() {
    let service = start_service();

    let server_handler = Arc::new(CountingSessionHandler::default());
    let server = TcpServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        server_handler.clone(),
    );
    assert!(server.start());

    let client_handler = Arc::new(CountingClientHandler::default());
    let client = TcpClient::new(
        service.clone(),
        TcpClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    );

    assert!(client.connect());
    let id_before = client.id();
    assert!(client.reconnect());
    assert_eq!(client.id(), id_before);

    assert_eq!(client_handler.connected.load(Ordering::SeqCst), 2);
    assert_eq!(client_handler.disconnected.load(Ordering::SeqCst), 1);

    assert!(client.disconnect());
    assert_eq!(client_handler.connected.load(Ordering::SeqCst), 2);
    assert_eq!(client_handler.disconnected.load(Ordering::SeqCst), 2);
    assert!(wait_until(WAIT, || server_handler.disconnected.load(Ordering::SeqCst) == 2));

    service.stop();
}

#[test]
fn test_server_restart_rebinds_the_same_port() {
    let service = start_service();

    let server = TcpServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        Arc::new(CountingSessionHandler::default()),
    );
    assert!(server.start());
    let first = server.local_endpoint().unwrap();

    // rebind the concrete port that the first start got assigned
    assert!(server.stop());
    assert!(!server.is_started());

    let server = TcpServer::new(
        service.clone(),
        TcpServerConfig::new(first),
        Arc::new(CountingSessionHandler::default()),
    );
    assert!(server.start());
    assert_eq!(server.local_endpoint(), Some(first));
    assert!(server.restart());
    assert_eq!(server.local_endpoint(), Some(first));

    service.stop();
}

#[test]
fn test_stopping_the_service_disconnects_live_sessions() {
    let service = start_service();

    let server_handler = Arc::new(CountingSessionHandler::default());
    let server = TcpServer::new(
        service.clone(),
        TcpServerConfig::new(localhost(0)),
        server_handler.clone(),
    );
    assert!(server.start());

    let client_handler = Arc::new(CountingClientHandler::default());
    let client = TcpClient::new(
        service.clone(),
        TcpClientConfig::new(server.local_endpoint().unwrap()),
        client_handler.clone(),
    );
    assert!(client.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    // service stop tears everything down; every live session fires on_disconnected
    assert!(service.stop());
    assert_eq!(server_handler.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(client_handler.disconnected.load(Ordering::SeqCst), 1);
}
