pub mod client;
pub mod config;
pub mod server;

pub use client::{TlsClient, TlsClientConfig};
pub use config::{TlsClientOptions, TlsServerOptions};
pub use server::{TlsServer, TlsServerConfig};
