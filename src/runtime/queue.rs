//! The callback queue shared between the engine thread and the dispatch thread.
//!
//! Pending events form an intrusive singly linked stack: `push` prepends and
//! `pop` takes the head, so events queued while the dispatch thread is busy are
//! delivered newest first. Engines serialize their callbacks on a single
//! network thread, so in practice at most a handful of events are pending at
//! any time.
//!
//! The head is only touched while holding the mutex. The condition variable
//! is signalled exactly once per push; the only waiter is the dispatch thread.
//!
//! A queue is either open, closed or aborted. Closing rejects new pushes but
//! lets the waiter drain what is left; aborting also makes the waiter return
//! immediately. A rejected push hands the event back to the caller.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::event::Event;

struct Node {
    event: Event,
    next: Option<Box<Node>>,
}

#[derive(Default)]
struct QueueState {
    head: Option<Box<Node>>,
    len: usize,
    closed: bool,
    abort: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<Event> {
        self.head.take().map(|node| {
            let Node { event, next } = *node;
            self.head = next;
            self.len -= 1;
            event
        })
    }
}

impl Drop for QueueState {
    // Unlink iteratively; the default recursive drop overflows on long chains.
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

#[derive(Default)]
pub(crate) struct CallbackQueue {
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl CallbackQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Handlers never run under this lock, so a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Prepends `event` and wakes the waiter.
    ///
    /// Returns the event untouched if the queue was closed or aborted.
    pub(crate) fn push(&self, event: Event) -> Result<(), Event> {
        let mut state = self.lock();
        if state.closed {
            return Err(event);
        }
        let next = state.head.take();
        state.head = Some(Box::new(Node { event, next }));
        state.len += 1;
        self.signal.notify_one();
        Ok(())
    }

    /// Removes the head without blocking.
    pub(crate) fn pop(&self) -> Option<Event> {
        self.lock().pop()
    }

    /// Blocks until an event is available, the queue is closed and empty, or
    /// the queue is aborted.
    ///
    /// Returns `None` once [`abort`](Self::abort) has been called, even if
    /// events are still pending.
    pub(crate) fn wait_and_pop(&self) -> Option<Event> {
        let mut state = self.lock();
        loop {
            if state.abort {
                return None;
            }
            if let Some(event) = state.pop() {
                return Some(event);
            }
            if state.closed {
                return None;
            }
            state = self
                .signal
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Rejects further pushes; the waiter returns once the queue is empty.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.signal.notify_one();
    }

    /// Rejects further pushes and requests the waiter to return right away.
    pub(crate) fn abort(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.abort = true;
        self.signal.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_aborted(&self) -> bool {
        self.lock().abort
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len
    }

    /// Drops every pending event, returning how many were discarded.
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.lock();
        let discarded = state.len;
        let mut next = state.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
        state.len = 0;
        discarded
    }
}
