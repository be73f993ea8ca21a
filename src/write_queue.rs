use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// What to do when an enqueue would push the queue past its high-water mark.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum OverflowPolicy {
    /// Reject the item being enqueued; the connection stays up.
    DropNewest,
    /// Close the connection - a peer that cannot keep up is cut off.
    Disconnect,
}

#[derive(Clone, Copy, Debug)]
pub struct WriteQueueConfig {
    /// Maximum number of buffered bytes before the overflow policy kicks in. `None`
    ///  means unbounded.
    pub high_water_mark: Option<usize>,
    pub overflow_policy: OverflowPolicy,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        WriteQueueConfig {
            high_water_mark: None,
            overflow_policy: OverflowPolicy::Disconnect,
        }
    }
}

#[derive(Eq, PartialEq, Debug)]
pub enum EnqueueOutcome {
    /// The item was accepted; the number is its length in bytes.
    Queued(usize),
    /// The item was rejected per `OverflowPolicy::DropNewest`.
    Dropped,
    /// The item was rejected and the connection should be closed per
    ///  `OverflowPolicy::Disconnect`.
    Overflow,
}

/// FIFO of outbound items awaiting transmission on one connection. The driver task is the
///  only consumer, and it holds at most one item "in flight" at a time: an item is popped
///  only when the driver is ready to write it, and the next pop happens only after that
///  write completed. Producers may enqueue from any thread.
pub struct WriteQueue<T> {
    items: Mutex<VecDeque<(T, usize)>>,
    pending_bytes: AtomicUsize,
    available: Notify,
    config: WriteQueueConfig,
}

impl<T> WriteQueue<T> {
    pub fn new(config: WriteQueueConfig) -> WriteQueue<T> {
        WriteQueue {
            items: Mutex::new(VecDeque::new()),
            pending_bytes: AtomicUsize::new(0),
            available: Notify::new(),
            config,
        }
    }

    pub fn enqueue(&self, item: T, byte_len: usize) -> EnqueueOutcome {
        if let Some(high_water_mark) = self.config.high_water_mark {
            if self.pending_bytes.load(Ordering::Acquire) + byte_len > high_water_mark {
                return match self.config.overflow_policy {
                    OverflowPolicy::DropNewest => EnqueueOutcome::Dropped,
                    OverflowPolicy::Disconnect => EnqueueOutcome::Overflow,
                };
            }
        }

        self.items.lock().unwrap().push_back((item, byte_len));
        self.pending_bytes.fetch_add(byte_len, Ordering::AcqRel);
        self.available.notify_one();
        EnqueueOutcome::Queued(byte_len)
    }

    /// Wait until an item is available and dequeue it. Cancel safe: an item is removed
    ///  only when this future completes.
    pub async fn next(&self) -> (T, usize) {
        loop {
            if let Some(entry) = self.try_next() {
                return entry;
            }
            self.available.notified().await;
        }
    }

    pub fn try_next(&self) -> Option<(T, usize)> {
        let entry = self.items.lock().unwrap().pop_front();
        if let Some((_, byte_len)) = &entry {
            self.pending_bytes.fetch_sub(*byte_len, Ordering::AcqRel);
        }
        entry
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        let mut items = self.items.lock().unwrap();
        items.clear();
        self.pending_bytes.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn queue(high_water_mark: Option<usize>, policy: OverflowPolicy) -> WriteQueue<Bytes> {
        WriteQueue::new(WriteQueueConfig {
            high_water_mark,
            overflow_policy: policy,
        })
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(None, OverflowPolicy::Disconnect);
        for payload in [&b"a"[..], b"bb", b"ccc"] {
            assert_eq!(
                q.enqueue(Bytes::copy_from_slice(payload), payload.len()),
                EnqueueOutcome::Queued(payload.len())
            );
        }
        assert_eq!(q.pending_bytes(), 6);

        assert_eq!(q.try_next().unwrap().0.as_ref(), b"a");
        assert_eq!(q.try_next().unwrap().0.as_ref(), b"bb");
        assert_eq!(q.try_next().unwrap().0.as_ref(), b"ccc");
        assert!(q.try_next().is_none());
        assert_eq!(q.pending_bytes(), 0);
    }

    #[rstest]
    #[case::drop_newest(OverflowPolicy::DropNewest, EnqueueOutcome::Dropped)]
    #[case::disconnect(OverflowPolicy::Disconnect, EnqueueOutcome::Overflow)]
    fn test_high_water_mark(#[case] policy: OverflowPolicy, #[case] expected: EnqueueOutcome) {
        let q = queue(Some(4), policy);
        assert_eq!(q.enqueue(Bytes::from_static(b"abc"), 3), EnqueueOutcome::Queued(3));
        assert_eq!(q.enqueue(Bytes::from_static(b"de"), 2), expected);
        // draining frees capacity again
        q.try_next().unwrap();
        assert_eq!(q.enqueue(Bytes::from_static(b"de"), 2), EnqueueOutcome::Queued(2));
    }

    #[test]
    fn test_next_wakes_on_enqueue() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let q = std::sync::Arc::new(queue(None, OverflowPolicy::Disconnect));

            let consumer = {
                let q = q.clone();
                tokio::spawn(async move { q.next().await })
            };
            tokio::task::yield_now().await;

            q.enqueue(Bytes::from_static(b"hello"), 5);
            let (item, byte_len) = consumer.await.unwrap();
            assert_eq!(item.as_ref(), b"hello");
            assert_eq!(byte_len, 5);
        });
    }

    #[test]
    fn test_clear() {
        let q = queue(None, OverflowPolicy::Disconnect);
        q.enqueue(Bytes::from_static(b"abc"), 3);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pending_bytes(), 0);
    }
}
