pub mod client;
pub mod server;
mod socket;

pub use client::{UdpClient, UdpClientConfig, UdpClientHandler};
pub use server::{UdpServer, UdpServerConfig, UdpServerHandler};
