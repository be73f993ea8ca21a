//! Asynchronous network server/client framework with a uniform reactor-based I/O model
//!  across several transports: TCP, UDP (including multicast), TLS-wrapped TCP, and
//!  WebSocket (plain and TLS), plus message-oriented pair / request-reply /
//!  publish-subscribe patterns layered on top.
//!
//! ## Model
//!
//! * A [service::Service] owns the reactor: one (or a small pool of) worker thread(s)
//!   running all I/O completions and all user callbacks. `start`/`stop` are blocking
//!   rendezvous, restartable, and `stop` guarantees that no callback fires after it
//!   returns.
//! * A server binds a socket on a service, accepts peers and owns one session per live
//!   connection in a registry; sessions carry a UUID, traffic counters and a write
//!   queue. Broadcast and aggregate statistics iterate the registry.
//! * A client connects to one peer, mirroring the session on the caller's side, and can
//!   disconnect/reconnect while keeping its identifier.
//! * Callbacks are trait objects with default no-op methods, handed to servers/clients
//!   at construction. For one session callbacks never overlap and always run in the
//!   order `on_connected` → (`on_received` | `on_sent`)* → `on_disconnected`; writes on
//!   one session keep the FIFO order of the `send` calls that queued them.
//! * `send` never blocks: it appends to the session's write queue and returns the byte
//!   count queued. At most one write per session is in flight at any time. A
//!   configurable high-water mark bounds the queue (drop or disconnect on overflow).
//!
//! ## Error handling
//!
//! Driver loops never propagate errors to application code - there is no caller. They
//!  report through `on_error` callbacks as (code, category, message) and either retry
//!  (transient errors), close the affected connection (per-connection fatal), or keep
//!  the listener going (accept failures).

pub mod endpoint;
pub mod error;
pub mod mq;
pub mod service;
pub mod session;
pub mod stats;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod util;
pub mod write_queue;
pub mod ws;

pub use endpoint::{Endpoint, Protocol};
pub use error::ErrorInfo;
pub use service::{Service, ServiceConfig, ServiceHandler, ServiceState};
pub use session::{ClientHandler, Session, SessionHandler};
pub use stats::TrafficSnapshot;
pub use write_queue::{OverflowPolicy, WriteQueueConfig};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
