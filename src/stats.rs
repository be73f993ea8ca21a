use std::sync::atomic::{AtomicU64, Ordering};

/// Per-connection traffic counters. "Messages" are write/read completions: datagrams for
///  UDP, frames for WebSocket, framed messages for the message-oriented transports, and
///  individual read/write operations for raw byte streams.
#[derive(Default, Debug)]
pub struct TrafficStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct TrafficSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

impl TrafficStats {
    pub(crate) fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }

    /// Fold a closed session's totals into a longer-lived aggregate, so server-level
    ///  statistics keep counting traffic of sessions that are gone.
    pub(crate) fn absorb(&self, snapshot: TrafficSnapshot) {
        self.bytes_sent.fetch_add(snapshot.bytes_sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(snapshot.bytes_received, Ordering::Relaxed);
        self.messages_sent.fetch_add(snapshot.messages_sent, Ordering::Relaxed);
        self.messages_received.fetch_add(snapshot.messages_received, Ordering::Relaxed);
    }
}

impl TrafficSnapshot {
    pub(crate) fn merge(&mut self, other: TrafficSnapshot) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.messages_sent += other.messages_sent;
        self.messages_received += other.messages_received;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_absorb() {
        let session = TrafficStats::default();
        session.add_sent(5);
        session.add_sent(3);
        session.add_received(4);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.bytes_sent, 8);
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_received, 4);
        assert_eq!(snapshot.messages_received, 1);

        let server = TrafficStats::default();
        server.absorb(snapshot);
        server.absorb(snapshot);
        assert_eq!(server.snapshot().bytes_sent, 16);
        assert_eq!(server.snapshot().messages_received, 2);
    }
}
