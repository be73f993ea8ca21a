//! Message-oriented transports over the TCP layer: every message travels as a
//!  length-prefixed frame, and the patterns in the submodules decide who talks to whom -
//!  [pair] for exactly two endpoints, [request] for request/reply, [pubsub] for
//!  topic-based fan-out.

pub mod frame;
pub mod pair;
pub mod pubsub;
pub mod request;

mod adapter;

pub use adapter::{MqClientHandler, MqServerHandler, MqSession};
pub use pair::{PairClient, PairServer};
pub use pubsub::{PublishServer, PublishServerHandler, SubscribeClient, SubscriberHandler};
pub use request::{RequestClient, RequestServer};
