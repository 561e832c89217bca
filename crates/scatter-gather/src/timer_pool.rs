//! Reuse pool for `tokio::time::Sleep` futures.
//!
//! Task bodies that need to sleep draw a timer from here instead of
//! allocating a fresh one, bounding allocation under high scatter rates
//! (§4.9/§9 "timer reuse" design note). Deadlines are additionally tracked
//! in a [`StableHeap`] so a future per-task watchdog has somewhere to look;
//! nothing in this crate reads that heap back out today beyond its own
//! removal bookkeeping.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::time::Sleep;

use crate::heap::{HeapIndex, StableHeap};

/// Caps how many idle `Sleep` futures are retained between uses.
const FREELIST_CAP: usize = 256;

struct Inner {
    free: Vec<Pin<Box<Sleep>>>,
    deadlines: StableHeap<Instant, ()>,
}

/// A shared, cloneable handle to a timer reuse pool.
#[derive(Clone)]
pub(crate) struct TimerPool {
    inner: Arc<Mutex<Inner>>,
}

impl TimerPool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                free: Vec::new(),
                deadlines: StableHeap::new(),
            })),
        }
    }

    /// Acquires a timer that fires after `duration`, reusing a freed
    /// `Sleep` if one is available.
    pub(crate) fn acquire(&self, duration: Duration) -> TimerHandle {
        let deadline = Instant::now() + duration;
        let mut inner = self.inner.lock().expect("timer pool mutex poisoned");
        let sleep = match inner.free.pop() {
            Some(mut sleep) => {
                sleep.as_mut().reset(tokio::time::Instant::from_std(deadline));
                sleep
            }
            None => Box::pin(tokio::time::sleep(duration)),
        };
        let heap_index = inner.deadlines.insert(deadline, ());
        drop(inner);
        TimerHandle {
            pool: self.clone(),
            sleep: Some(sleep),
            heap_index,
        }
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A single acquired, awaitable timer. Returns its `Sleep` to the pool's
/// freelist on drop (wake or cancel, either way).
pub(crate) struct TimerHandle {
    pool: TimerPool,
    sleep: Option<Pin<Box<Sleep>>>,
    heap_index: HeapIndex,
}

impl Future for TimerHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let sleep = this.sleep.as_mut().expect("TimerHandle polled after drop");
        sleep.as_mut().poll(cx)
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.lock().expect("timer pool mutex poisoned");
        inner.deadlines.remove(self.heap_index);
        if let Some(sleep) = self.sleep.take() {
            if inner.free.len() < FREELIST_CAP {
                inner.free.push(sleep);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let pool = TimerPool::new();
        let start = tokio::time::Instant::now();
        pool.acquire(Duration::from_millis(50)).await;
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn freed_timer_is_reused() {
        let pool = TimerPool::new();
        pool.acquire(Duration::from_millis(10)).await;
        // Dropping the handle above returns the Sleep to the freelist; a
        // second acquire should reuse it rather than allocate.
        {
            let inner = pool.inner.lock().unwrap();
            assert_eq!(inner.free.len(), 1);
        }
        let _second = pool.acquire(Duration::from_millis(10));
        let inner = pool.inner.lock().unwrap();
        assert_eq!(inner.free.len(), 0);
    }
}
