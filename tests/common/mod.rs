#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use netserver::endpoint::Endpoint;
use netserver::service::{Service, ServiceConfig};
use tracing::Level;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn start_service() -> Arc<Service> {
    let service = Service::new(ServiceConfig::default());
    assert!(service.start(false));
    service
}

pub fn localhost(port: u16) -> Endpoint {
    Endpoint::new("127.0.0.1", port).unwrap()
}

/// Poll `condition` until it holds or the deadline passes; returns its final value.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub const WAIT: Duration = Duration::from_secs(5);
