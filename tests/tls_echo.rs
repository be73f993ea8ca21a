mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netserver::error::{ErrorInfo, CATEGORY_TLS};
use netserver::session::{ClientHandler, Session, SessionHandler};
use netserver::tls::{TlsClient, TlsClientConfig, TlsClientOptions, TlsServer, TlsServerConfig, TlsServerOptions};

use common::{localhost, start_service, wait_until, WAIT};

struct Identity {
    _dir: tempfile::TempDir,
    cert_path: PathBuf,
    key_path: PathBuf,
}

/// Self-signed identity for "localhost", written out as PEM files the way a deployment
///  would provide them.
fn self_signed_identity() -> Identity {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
    Identity {
        _dir: dir,
        cert_path,
        key_path,
    }
}

#[derive(Default)]
struct EchoServerHandler {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    tls_errors: AtomicUsize,
}

#[async_trait]
impl SessionHandler for EchoServerHandler {
    async fn on_connected(&self, _session: &Arc<Session>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, session: &Arc<Session>, data: &[u8]) {
        session.send(data);
    }

    async fn on_disconnected(&self, _session: &Arc<Session>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_error(&self, error: &ErrorInfo) {
        if error.category == CATEGORY_TLS {
            self.tls_errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct RecordingClientHandler {
    connected: AtomicUsize,
    received: Mutex<Vec<u8>>,
    tls_errors: AtomicUsize,
}

#[async_trait]
impl ClientHandler for RecordingClientHandler {
    async fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_received(&self, data: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(data);
    }

    async fn on_error(&self, error: &ErrorInfo) {
        if error.category == CATEGORY_TLS {
            self.tls_errors.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_encrypted_echo_round_trip() {
    let identity = self_signed_identity();
    let service = start_service();

    let server_handler = Arc::new(EchoServerHandler::default());
    let server = TlsServer::new(
        service.clone(),
        TlsServerConfig::new(
            localhost(0),
            TlsServerOptions::new(&identity.cert_path, &identity.key_path),
        ),
        server_handler.clone(),
    )
    .unwrap();
    assert!(server.start());

    let client_handler = Arc::new(RecordingClientHandler::default());
    let client = TlsClient::new(
        service.clone(),
        TlsClientConfig::new(
            server.local_endpoint().unwrap(),
            TlsClientOptions {
                ca_path: Some(identity.cert_path.clone()),
                server_name: Some("localhost".to_owned()),
                ..TlsClientOptions::default()
            },
        ),
        client_handler.clone(),
    )
    .unwrap();

    assert!(client.connect());
    assert!(wait_until(WAIT, || server_handler.connected.load(Ordering::SeqCst) == 1));

    assert_eq!(client.send(b"secret"), 6);
    assert!(wait_until(WAIT, || client_handler.received.lock().unwrap().len() == 6));
    assert_eq!(client_handler.received.lock().unwrap().as_slice(), b"secret");
    assert_eq!(server.stats().bytes_received, 6);
    assert_eq!(server.stats().bytes_sent, 6);

    assert!(client.disconnect());
    assert!(wait_until(WAIT, || server_handler.disconnected.load(Ordering::SeqCst) == 1));

    service.stop();
}

#[test]
fn test_handshake_failure_creates_no_session() {
    let identity = self_signed_identity();
    let client_ca = self_signed_identity();
    let service = start_service();

    // the server demands a client certificate chaining to `client_ca`
    let mut options = TlsServerOptions::new(&identity.cert_path, &identity.key_path);
    options.ca_path = Some(client_ca.cert_path.clone());

    let server_handler = Arc::new(EchoServerHandler::default());
    let server = TlsServer::new(
        service.clone(),
        TlsServerConfig::new(localhost(0), options),
        server_handler.clone(),
    )
    .unwrap();
    assert!(server.start());

    // ... and the client presents none
    let client_handler = Arc::new(RecordingClientHandler::default());
    let client = TlsClient::new(
        service.clone(),
        TlsClientConfig::new(
            server.local_endpoint().unwrap(),
            TlsClientOptions {
                ca_path: Some(identity.cert_path.clone()),
                server_name: Some("localhost".to_owned()),
                ..TlsClientOptions::default()
            },
        ),
        client_handler.clone(),
    )
    .unwrap();

    assert!(!client.connect());
    assert!(wait_until(WAIT, || server_handler.tls_errors.load(Ordering::SeqCst) >= 1));

    // no session ever existed on either side
    assert_eq!(server_handler.connected.load(Ordering::SeqCst), 0);
    assert_eq!(server_handler.disconnected.load(Ordering::SeqCst), 0);
    assert_eq!(client_handler.connected.load(Ordering::SeqCst), 0);
    assert_eq!(server.connected_sessions(), 0);

    service.stop();
}

#[test]
fn test_client_rejects_untrusted_server() {
    let identity = self_signed_identity();
    let other_ca = self_signed_identity();
    let service = start_service();

    let server = TlsServer::new(
        service.clone(),
        TlsServerConfig::new(
            localhost(0),
            TlsServerOptions::new(&identity.cert_path, &identity.key_path),
        ),
        Arc::new(EchoServerHandler::default()),
    )
    .unwrap();
    assert!(server.start());

    // trusting a different CA: the server certificate must be refused
    let client_handler = Arc::new(RecordingClientHandler::default());
    let client = TlsClient::new(
        service.clone(),
        TlsClientConfig::new(
            server.local_endpoint().unwrap(),
            TlsClientOptions {
                ca_path: Some(other_ca.cert_path.clone()),
                server_name: Some("localhost".to_owned()),
                ..TlsClientOptions::default()
            },
        ),
        client_handler.clone(),
    )
    .unwrap();

    assert!(!client.connect());
    assert_eq!(client_handler.connected.load(Ordering::SeqCst), 0);
    assert!(client_handler.tls_errors.load(Ordering::SeqCst) >= 1);

    service.stop();
}
