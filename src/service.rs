use std::cell::Cell;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorInfo;
use crate::util::state_flag::StateFlag;
use crate::util::task_group::TaskGroup;

/// Lifecycle hooks of a [Service], invoked on its worker threads. All methods default to
///  no-ops so implementors override only what they need.
pub trait ServiceHandler: Send + Sync + 'static {
    /// Called on each worker thread right after it starts, before any I/O work.
    fn on_thread_initialize(&self) {}
    /// Called on each worker thread just before it exits.
    fn on_thread_cleanup(&self) {}
    fn on_started(&self) {}
    fn on_stopped(&self) {}
    /// Called between reactor iterations when the service runs in polling mode.
    fn on_idle(&self) {}
    fn on_error(&self, _error: &ErrorInfo) {}
}

struct NoopServiceHandler;
impl ServiceHandler for NoopServiceHandler {}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

#[derive(Clone, Copy, Debug)]
pub struct ServiceConfig {
    pub worker_threads: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig { worker_threads: 1 }
    }
}

thread_local! {
    static CURRENT_SERVICE: Cell<Option<Uuid>> = const { Cell::new(None) };
}

/// The I/O event loop runtime that servers, sessions and clients attach to. One `Service`
///  owns one reactor with a configurable number of worker threads; all I/O completions
///  and user callbacks for attached components run on those workers, never on the thread
///  that called `start` / `stop` / `send`.
///
/// `start` and `stop` are blocking rendezvous: when `start` returns, a worker has entered
///  the loop and `on_started` has run; when `stop` returns, every tracked task has
///  drained and no further callback will fire. Both must be called from outside the
///  service's own worker threads. A stopped service can be started again.
pub struct Service {
    id: Uuid,
    config: ServiceConfig,
    handler: Arc<dyn ServiceHandler>,
    state: Mutex<ServiceState>,
    core: Mutex<Option<ServiceCore>>,
    last_poll_mode: Mutex<bool>,
}

struct ServiceCore {
    runtime: Runtime,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Arc<TaskGroup>,
}

impl Service {
    pub fn new(config: ServiceConfig) -> Arc<Service> {
        Service::with_handler(config, Arc::new(NoopServiceHandler))
    }

    pub fn with_handler(config: ServiceConfig, handler: Arc<dyn ServiceHandler>) -> Arc<Service> {
        Arc::new(Service {
            id: Uuid::new_v4(),
            config,
            handler,
            state: Mutex::new(ServiceState::Stopped),
            core: Mutex::new(None),
            last_poll_mode: Mutex::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Start the worker threads and block until the reactor is running and `on_started`
    ///  has returned. With `poll_mode` a dedicated task busy-polls the reactor, invoking
    ///  `on_idle` between iterations; otherwise workers block on events.
    ///
    /// Returns false if the service is not currently stopped.
    pub fn start(&self, poll_mode: bool) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ServiceState::Stopped {
                return false;
            }
            *state = ServiceState::Starting;
        }

        let runtime = {
            let id = self.id;
            let init_handler = self.handler.clone();
            let cleanup_handler = self.handler.clone();
            Builder::new_multi_thread()
                .worker_threads(self.config.worker_threads)
                .thread_name(format!("netserver-{}", self.id.as_simple()))
                .enable_all()
                .on_thread_start(move || {
                    CURRENT_SERVICE.set(Some(id));
                    init_handler.on_thread_initialize();
                })
                .on_thread_stop(move || {
                    CURRENT_SERVICE.set(None);
                    cleanup_handler.on_thread_cleanup();
                })
                .build()
        };
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("failed to start reactor: {}", e);
                self.handler.on_error(&ErrorInfo::from_io(&e));
                *self.state.lock().unwrap() = ServiceState::Stopped;
                return false;
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = Arc::new(TaskGroup::new());

        // rendezvous: a worker must have entered the loop and run on_started before
        //  start() returns
        let started = Arc::new(StateFlag::new(false));
        {
            let handler = self.handler.clone();
            let started = started.clone();
            runtime.spawn(async move {
                handler.on_started();
                started.set(true);
            });
        }
        started.wait_for(true);

        if poll_mode {
            let handler = self.handler.clone();
            let shutdown = shutdown_rx.clone();
            runtime.spawn(tasks.track(async move {
                while !*shutdown.borrow() {
                    handler.on_idle();
                    tokio::task::yield_now().await;
                }
            }));
        }

        *self.core.lock().unwrap() = Some(ServiceCore {
            runtime,
            shutdown_tx,
            shutdown_rx,
            tasks,
        });
        *self.last_poll_mode.lock().unwrap() = poll_mode;
        *self.state.lock().unwrap() = ServiceState::Started;

        info!(service = %self.id, workers = self.config.worker_threads, poll_mode, "service started");
        true
    }

    /// Signal shutdown, wait for all tracked tasks to drain (every live session fires
    ///  `on_disconnected` on the way out), run `on_stopped`, then tear down the workers.
    ///
    /// Returns false if the service is not currently started. Must not be called from a
    ///  worker thread.
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ServiceState::Started {
                return false;
            }
            *state = ServiceState::Stopping;
        }

        let core = self.core.lock().unwrap().take();
        let Some(core) = core else {
            *self.state.lock().unwrap() = ServiceState::Stopped;
            return false;
        };

        debug!(service = %self.id, "shutting down: signalling tasks");
        let _ = core.shutdown_tx.send(true);
        core.tasks.wait_idle();

        let stopped = Arc::new(StateFlag::new(false));
        {
            let handler = self.handler.clone();
            let stopped = stopped.clone();
            core.runtime.spawn(async move {
                handler.on_stopped();
                stopped.set(true);
            });
        }
        stopped.wait_for(true);

        core.runtime.shutdown_timeout(Duration::from_secs(5));
        *self.state.lock().unwrap() = ServiceState::Stopped;

        info!(service = %self.id, "service stopped");
        true
    }

    /// Stop followed by start with the previous polling mode.
    pub fn restart(&self) -> bool {
        if !self.stop() {
            return false;
        }
        let poll_mode = *self.last_poll_mode.lock().unwrap();
        self.start(poll_mode)
    }

    /// Enqueue a unit of work onto a worker thread. Returns false when the service is
    ///  not started.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let guard = self.core.lock().unwrap();
        match guard.as_ref() {
            Some(core) => {
                core.runtime.spawn(async move { task() });
                true
            }
            None => false,
        }
    }

    /// Like [Self::post], but executes inline when the caller is already on one of this
    ///  service's worker threads.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if CURRENT_SERVICE.get() == Some(self.id) {
            task();
            true
        } else {
            self.post(task)
        }
    }

    /// Spawn a tracked future: `stop` waits for it, and it is expected to terminate
    ///  promptly once the shutdown signal fires.
    pub(crate) fn spawn_tracked<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.core.lock().unwrap();
        match guard.as_ref() {
            Some(core) => {
                core.runtime.spawn(core.tasks.track(fut));
                true
            }
            None => false,
        }
    }

    /// Observed by every driver loop; flips to true exactly once per started period.
    pub(crate) fn shutdown_signal(&self) -> Option<watch::Receiver<bool>> {
        self.core.lock().unwrap().as_ref().map(|c| c.shutdown_rx.clone())
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if self.is_started() {
            self.stop();
        }
    }
}
