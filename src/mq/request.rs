use std::sync::Arc;

use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::mq::adapter::{FramedClientAdapter, FramedServerAdapter, MqClientHandler, MqServerHandler};
use crate::mq::frame::encode_frame;
use crate::service::Service;
use crate::stats::TrafficSnapshot;
use crate::tcp::{TcpClient, TcpClientConfig, TcpServer, TcpServerConfig};

/// Request/reply server: any number of requesting clients; each incoming message is a
///  request, and the handler replies on the session it arrived on
///  (`session.send_message`).
pub struct RequestServer {
    server: TcpServer,
}

impl RequestServer {
    pub fn new(
        service: Arc<Service>,
        config: TcpServerConfig,
        handler: Arc<dyn MqServerHandler>,
    ) -> RequestServer {
        let adapter = Arc::new(FramedServerAdapter::new(handler, false));
        RequestServer {
            server: TcpServer::new(service, config, adapter),
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

    pub fn connected_clients(&self) -> usize {
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
}

/// Requesting client: sends request messages, replies arrive through `on_received` in
///  the order the server answers them.
pub struct RequestClient {
    client: Arc<TcpClient>,
}

impl RequestClient {
    pub fn new(
        service: Arc<Service>,
        config: TcpClientConfig,
        handler: Arc<dyn MqClientHandler>,
    ) -> RequestClient {
        let adapter = Arc::new(FramedClientAdapter::new(handler));
        let client = Arc::new(TcpClient::new(service, config, adapter.clone()));
        let weak = Arc::downgrade(&client);
        adapter.set_abort(Box::new(move || {
            if let Some(client) = weak.upgrade() {
                client.disconnect_async();
            }
        }));
        RequestClient { client }
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

    /// Send one request; returns the payload bytes queued, 0 on failure.
    pub fn request(&self, message: &[u8]) -> usize {
        if self.client.send(&encode_frame(message)) == 0 {
            0
        } else {
            message.len()
        }
    }
}
