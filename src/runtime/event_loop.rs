//! The dispatch thread and the mode switch in front of it.
//!
//! A connection is either in inline mode, where trampolines run handlers on
//! the engine thread, or in threaded mode, where they push events to a
//! [`CallbackQueue`] drained by a dedicated thread.
//!
//! The queue exists only while the dispatch thread runs: it is created on
//! start and released on stop. The `threaded` flag is raised only after the
//! queue is installed and lowered before it is removed. A trampoline that
//! still reaches a queue being stopped gets its event handed back and runs
//! it inline, so every event is either handled or counted as discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, Builder, JoinHandle};

use super::handlers::HandlerTable;
use super::queue::CallbackQueue;
use crate::config::{ClientOptions, FailurePolicy};
use crate::error::{DispatchError, MqttError};
use crate::event::Event;

/// What happens to queued events when the dispatch thread stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopMode {
    /// Run every queued handler before the thread exits.
    Drain,
    /// Drop queued events; only a handler already running finishes.
    Discard,
}

/// State shared by the engine thread, the dispatch thread and the client.
pub(crate) struct Shared {
    pub(crate) handlers: HandlerTable,
    pub(crate) failures: FailureSink,
    policy: FailurePolicy,
}

impl Shared {
    /// Runs the handler for `event`, logging and recording a failure.
    /// Returns `true` if the handler failed.
    fn dispatch(&self, event: Event) -> bool {
        let Err(err) = self.handlers.invoke(event) else {
            return false;
        };
        error!("{err}");
        self.failures.record(MqttError::Handler(err));
        true
    }
}

/// Failures nobody could be handed synchronously, kept until the client takes them.
pub(crate) struct FailureSink {
    failures: Mutex<VecDeque<MqttError>>,
    capacity: usize,
}

impl FailureSink {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            failures: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<MqttError>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record(&self, failure: MqttError) {
        if self.capacity == 0 {
            return;
        }
        let mut failures = self.lock();
        if failures.len() == self.capacity {
            if let Some(dropped) = failures.pop_front() {
                warn!("failure sink full, dropping: {dropped}");
            }
        }
        failures.push_back(failure);
    }

    pub(crate) fn take(&self) -> Vec<MqttError> {
        self.lock().drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

struct LoopThread {
    handle: JoinHandle<()>,
    queue: Arc<CallbackQueue>,
}

/// Owns the dispatch thread of one connection.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    threaded: Arc<AtomicBool>,
    queue: RwLock<Option<Arc<CallbackQueue>>>,
    thread: Mutex<Option<LoopThread>>,
    thread_name: String,
    discarded: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                handlers: HandlerTable::new(),
                failures: FailureSink::new(options.failure_capacity),
                policy: options.failure_policy,
            }),
            threaded: Arc::new(AtomicBool::new(false)),
            queue: RwLock::new(None),
            thread: Mutex::new(None),
            thread_name: options.dispatch_thread_name.clone(),
            discarded: AtomicUsize::new(0),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Whether trampolines currently hand events to the dispatch thread.
    pub(crate) fn is_threaded(&self) -> bool {
        self.threaded.load(Ordering::Acquire)
    }

    fn installed_queue(&self) -> Option<Arc<CallbackQueue>> {
        self.queue
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install_queue(&self, queue: Option<Arc<CallbackQueue>>) {
        *self.queue.write().unwrap_or_else(PoisonError::into_inner) = queue;
    }

    fn lock_thread(&self) -> MutexGuard<'_, Option<LoopThread>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a dispatch thread exists and has not exited.
    pub(crate) fn is_running(&self) -> bool {
        self.lock_thread()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Total number of queued events dropped by discarding stops.
    pub(crate) fn discarded(&self) -> usize {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Number of events waiting for the dispatch thread.
    pub(crate) fn pending(&self) -> usize {
        self.installed_queue().map_or(0, |queue| queue.len())
    }

    /// Queues `event` for the dispatch thread, or runs its handler right here
    /// when no dispatch thread is running.
    ///
    /// The inline path only reads an atomic flag and never takes a lock
    /// around the queue. Users must not block in handlers in that mode, since
    /// they run on the engine's network thread.
    pub(crate) fn enqueue_or_run_inline(&self, event: Event) -> Result<(), DispatchError> {
        let event = match self.threaded_queue() {
            Some(queue) => match queue.push(event) {
                Ok(()) => return Ok(()),
                // The queue closed under us; the dispatch thread is going away.
                Err(event) => event,
            },
            None => event,
        };
        self.shared.handlers.invoke(event)
    }

    fn threaded_queue(&self) -> Option<Arc<CallbackQueue>> {
        if self.is_threaded() {
            self.installed_queue()
        } else {
            None
        }
    }

    /// Starts the dispatch thread.
    ///
    /// Returns `Ok(false)` without side effects when a dispatch thread is
    /// already running.
    pub(crate) fn start(&self) -> Result<bool, MqttError> {
        let mut slot = self.lock_thread();

        // The flag only drops while a thread is installed when that thread
        // stopped itself after a handler failure; it is reaped here.
        if slot.is_some() && self.is_threaded() {
            return Ok(false);
        }
        if let Some(stale) = slot.take() {
            self.release(stale, StopMode::Drain);
        }

        let queue = Arc::new(CallbackQueue::new());
        self.install_queue(Some(Arc::clone(&queue)));

        let spawned = Builder::new().name(self.thread_name.clone()).spawn({
            let shared = Arc::clone(&self.shared);
            let queue = Arc::clone(&queue);
            let threaded = Arc::clone(&self.threaded);
            move || run(shared, queue, threaded)
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.install_queue(None);
                error!("failed to spawn dispatch thread: {err}");
                return Err(MqttError::Io(err));
            }
        };

        self.threaded.store(true, Ordering::Release);
        *slot = Some(LoopThread { handle, queue });
        debug!("dispatch thread {} started", self.thread_name);
        Ok(true)
    }

    /// Stops the dispatch thread.
    ///
    /// A handler already running is allowed to finish. With
    /// [`StopMode::Drain`] every queued event is handled before this returns;
    /// with [`StopMode::Discard`] queued events are dropped. Returns `false`
    /// if no dispatch thread was running.
    pub(crate) fn stop(&self, mode: StopMode) -> bool {
        let Some(running) = self.lock_thread().take() else {
            trace!("dispatch thread not running");
            return false;
        };
        self.release(running, mode);
        debug!("dispatch thread {} stopped", self.thread_name);
        true
    }

    fn release(&self, running: LoopThread, mode: StopMode) {
        let LoopThread { handle, queue } = running;

        self.threaded.store(false, Ordering::Release);
        match mode {
            StopMode::Drain => queue.close(),
            StopMode::Discard => queue.abort(),
        }

        let own_thread = handle.thread().id() == thread::current().id();
        if own_thread {
            // Stopped from inside a handler: the thread exits once the handler returns.
            debug!("dispatch thread stopping itself");
        } else if handle.join().is_err() {
            error!("dispatch thread panicked");
        }

        self.install_queue(None);
        if own_thread && mode == StopMode::Drain {
            return;
        }
        let discarded = queue.clear();
        if discarded > 0 {
            self.discarded.fetch_add(discarded, Ordering::Relaxed);
            warn!("discarded {discarded} pending events");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop(StopMode::Discard);
    }
}

fn run(shared: Arc<Shared>, queue: Arc<CallbackQueue>, threaded: Arc<AtomicBool>) {
    while let Some(event) = queue.wait_and_pop() {
        if !shared.dispatch(event) || shared.policy != FailurePolicy::StopLoop {
            continue;
        }

        // Later events run inline; those already queued are delivered here.
        threaded.store(false, Ordering::Release);
        queue.close();
        let mut delivered = 0;
        while let Some(event) = queue.pop() {
            shared.dispatch(event);
            delivered += 1;
        }
        warn!("dispatch thread terminated after handler failure ({delivered} queued events delivered)");
        break;
    }
}
