use std::future::Future;
use std::sync::{Arc, Condvar, Mutex};

/// Bookkeeping for the spawned tasks belonging to a service or server: shutdown waits
///  until every tracked task has run to completion, which is what guarantees that no
///  callback fires after `stop` returns.
pub struct TaskGroup {
    active: Mutex<usize>,
    drained: Condvar,
}

impl Default for TaskGroup {
    fn default() -> Self {
        TaskGroup::new()
    }
}

impl TaskGroup {
    pub fn new() -> TaskGroup {
        TaskGroup {
            active: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    /// Wrap a future so that it counts as active until it completes (or is dropped).
    pub fn track<F>(self: &Arc<Self>, fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let token = TaskToken::new(self.clone());
        async move {
            let _token = token;
            fut.await
        }
    }

    pub fn active_count(&self) -> usize {
        *self.active.lock().unwrap()
    }

    /// Block the calling thread until no tracked task is active. Must not be called from
    ///  inside a tracked task.
    pub fn wait_idle(&self) {
        let mut guard = self.active.lock().unwrap();
        while *guard > 0 {
            guard = self.drained.wait(guard).unwrap();
        }
    }
}

struct TaskToken {
    group: Arc<TaskGroup>,
}

impl TaskToken {
    fn new(group: Arc<TaskGroup>) -> TaskToken {
        *group.active.lock().unwrap() += 1;
        TaskToken { group }
    }
}

impl Drop for TaskToken {
    fn drop(&mut self) {
        let mut guard = self.group.active.lock().unwrap();
        *guard -= 1;
        if *guard == 0 {
            self.group.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::runtime::Builder;

    #[test]
    fn test_wait_idle_after_completion() {
        let group = Arc::new(TaskGroup::new());
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        rt.spawn(group.track(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }));
        rt.spawn(group.track(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }));

        group.wait_idle();
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn test_token_released_on_cancellation() {
        let group = Arc::new(TaskGroup::new());
        let rt = Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let handle = rt.spawn(group.track(std::future::pending::<()>()));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(group.active_count(), 1);

        handle.abort();
        group.wait_idle();
    }
}
