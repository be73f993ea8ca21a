use std::sync::Arc;

use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::mq::adapter::{FramedClientAdapter, FramedServerAdapter, MqClientHandler, MqServerHandler, MqSession};
use crate::mq::frame::encode_frame;
use crate::service::Service;
use crate::stats::TrafficSnapshot;
use crate::tcp::{TcpClient, TcpClientConfig, TcpServer, TcpServerConfig};

/// Exactly-two-endpoints messaging: the server admits one peer at a time and refuses
///  further connections while that peer is live. Both sides send and receive framed
///  messages.
pub struct PairServer {
    server: TcpServer,
    adapter: Arc<FramedServerAdapter>,
}

impl PairServer {
    pub fn new(
        service: Arc<Service>,
        config: TcpServerConfig,
        handler: Arc<dyn MqServerHandler>,
    ) -> PairServer {
        let adapter = Arc::new(FramedServerAdapter::new(handler, true));
        let server = TcpServer::new(service, config, adapter.clone());
        PairServer { server, adapter }
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

    /// Send one message to the paired peer; 0 when no peer is connected.
    pub fn send_message(&self, message: &[u8]) -> usize {
        let Some(peer) = self.adapter.active_peer() else {
            return 0;
        };
        match self.server.session(peer) {
            Some(session) => MqSession::new(session).send_message(message),
            None => 0,
        }
    }
}

/// Client side of a [PairServer] pairing.
pub struct PairClient {
    client: Arc<TcpClient>,
}

impl PairClient {
    pub fn new(
        service: Arc<Service>,
        config: TcpClientConfig,
        handler: Arc<dyn MqClientHandler>,
    ) -> PairClient {
        let adapter = Arc::new(FramedClientAdapter::new(handler));
        let client = Arc::new(TcpClient::new(service, config, adapter.clone()));
        let weak = Arc::downgrade(&client);
        adapter.set_abort(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.disconnect_async();
            }
        }));
        PairClient { client }
    }

    pub fn id(&self) -> Uuid {
        self.client.id()
    }

    pub fn endpoint(&self) -> Endpoint {
        self.client.endpoint()
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

    /// Send one framed message; returns the payload bytes queued, 0 on failure.
    pub fn send_message(&self, message: &[u8]) -> usize {
        if self.client.send(&encode_frame(message)) == 0 {
            0
        } else {
            message.len()
        }
    }
}
