use std::sync::{Condvar, Mutex};

/// A boolean flag that threads can block on until it reaches a desired value. This is the
///  rendezvous between a caller of `start` / `stop` / `connect` and the worker that
///  observes the state transition - a condvar wait, not a busy-wait on an atomic.
pub struct StateFlag {
    value: Mutex<bool>,
    changed: Condvar,
}

impl StateFlag {
    pub fn new(initial: bool) -> StateFlag {
        StateFlag {
            value: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    pub fn set(&self, value: bool) {
        let mut guard = self.value.lock().unwrap();
        *guard = value;
        self.changed.notify_all();
    }

    pub fn get(&self) -> bool {
        *self.value.lock().unwrap()
    }

    pub fn wait_for(&self, value: bool) {
        let mut guard = self.value.lock().unwrap();
        while *guard != value {
            guard = self.changed.wait(guard).unwrap();
        }
    }
}
