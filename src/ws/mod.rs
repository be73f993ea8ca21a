pub mod client;
pub mod server;
mod session;

pub use client::{WsClient, WsClientConfig, WsClientHandler};
pub use server::{WsServer, WsServerConfig};
pub use session::{WsSession, WsSessionHandler};

pub use tokio_tungstenite::tungstenite::protocol::Message;
