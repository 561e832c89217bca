//! Blocking-slot primitive backing pool admission.
//!
//! A caller registers and gets back a one-shot completion signal; a
//! producer wakes the front waiter when a slot frees. A waiter that was
//! woken but had already lost interest (its receiver was dropped, e.g.
//! because its own context was cancelled) forwards the wakeup to the next
//! waiter in line, so no slot is ever silently leaked to a waiter who
//! isn't coming.
//!
//! [`wake_front`] is the bare forwarding logic, operating on a plain
//! [`crate::fifo::Fifo`] under a caller-supplied lock. `Pool` uses it
//! directly, under the same mutex that guards its in-flight counter, so "is
//! a slot free" and "who gets it" are decided atomically. [`WaiterQueue`]
//! wraps the same logic with its own lock for standalone use and testing.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::fifo::Fifo;

/// Wakes the front waiter in `queue`. If that waiter's receiver was
/// already dropped (it gave up), the signal forwards to the next one in
/// line until one accepts it or the queue runs dry.
///
/// Returns whether a waiter was actually woken.
pub(crate) fn wake_front(queue: &mut Fifo<oneshot::Sender<()>>) -> bool {
    while let Some(tx) = queue.pop_front() {
        if tx.send(()).is_ok() {
            return true;
        }
    }
    false
}

/// A standalone, self-locking FIFO queue of one-shot wakeups, implementing
/// the five waiter states from the data model: a receiver is *enqueued,
/// unsignaled* until `send` succeeds (*signaled*) or the receiver is
/// dropped (*closed*, and the wakeup is forwarded to the next entry).
pub(crate) struct WaiterQueue {
    inner: Mutex<Fifo<oneshot::Sender<()>>>,
}

impl WaiterQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Fifo::new()),
        }
    }

    /// Registers a new waiter at the back of the queue, returning the
    /// receiving half the caller awaits.
    pub(crate) fn enqueue(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("waiter queue mutex poisoned")
            .push_back(tx);
        rx
    }

    /// See [`wake_front`].
    pub(crate) fn wake_next(&self) -> bool {
        wake_front(&mut self.inner.lock().expect("waiter queue mutex poisoned"))
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("waiter queue mutex poisoned").len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for WaiterQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_front_waiter_first() {
        let q = WaiterQueue::new();
        let rx1 = q.enqueue();
        let rx2 = q.enqueue();

        assert!(q.wake_next());
        assert!(rx1.await.is_ok());

        assert!(q.wake_next());
        assert!(rx2.await.is_ok());
    }

    #[tokio::test]
    async fn forwards_past_dropped_receiver() {
        let q = WaiterQueue::new();
        let rx1 = q.enqueue();
        let rx2 = q.enqueue();
        drop(rx1);

        assert!(q.wake_next());
        assert!(rx2.await.is_ok());
    }

    #[tokio::test]
    async fn wake_on_empty_queue_returns_false() {
        let q = WaiterQueue::new();
        assert!(!q.wake_next());
    }

    #[tokio::test]
    async fn wake_with_all_receivers_dropped_returns_false() {
        let q = WaiterQueue::new();
        let rx1 = q.enqueue();
        let rx2 = q.enqueue();
        drop(rx1);
        drop(rx2);
        assert!(!q.wake_next());
    }
}
