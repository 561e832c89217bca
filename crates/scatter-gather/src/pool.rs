//! Admission gate with a fixed concurrency limit.
//!
//! Grants at most `limit` concurrently running tasks; beyond that, callers
//! queue FIFO (modulo cancellation) on [`waiter::wake_front`]. The
//! in-flight counter and the waiter queue live under one mutex so "is a
//! slot free" and "who gets it" are decided atomically — a freed slot is
//! handed directly to the next waiter rather than published as a counter
//! decrement a second admitter could race to claim first.

use std::sync::{Mutex, OnceLock};

use tokio::sync::oneshot;

use crate::config::PoolConfig;
use crate::ctx::Scope;
use crate::error::Error;
use crate::fifo::Fifo;
use crate::waiter::wake_front;

struct PoolState {
    in_flight: usize,
    waiters: Fifo<oneshot::Sender<()>>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Set once this pool is bound to a job. A second bind attempt panics
    /// (§4.2: "panics if any pool is already bound").
    bound: OnceLock<()>,
}

/// An admission gate bound to exactly one [`crate::Job`] for its lifetime.
#[derive(Clone)]
pub struct Pool {
    inner: std::sync::Arc<PoolInner>,
}

impl Pool {
    /// Creates a new, unbound pool. Bind it to a job by passing it to
    /// [`crate::Job::new`].
    pub fn new(config: PoolConfig) -> Self {
        Self {
            inner: std::sync::Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    in_flight: 0,
                    waiters: Fifo::new(),
                }),
                bound: OnceLock::new(),
            }),
        }
    }

    /// The label this pool reports in observability events.
    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    /// The configured concurrency limit (`config::UNBOUNDED` if none).
    pub fn limit(&self) -> usize {
        self.inner.config.limit
    }

    /// Current number of running tasks admitted through this pool.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").in_flight
    }

    /// Current number of callers queued waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").waiters.len()
    }

    pub(crate) fn bind(&self) {
        self.inner
            .bound
            .set(())
            .unwrap_or_else(|_| panic!("pool {:?} is already bound to a job", self.label()));
    }

    /// Blocks until a slot is available, `scope` is cancelled, or the
    /// owning job's context (reachable through `scope`'s ancestry) is
    /// cancelled. Returns `Ok(())` having already reserved the slot; the
    /// caller must eventually call [`Pool::release`] exactly once.
    pub(crate) async fn admit(&self, scope: &Scope) -> Result<(), Error> {
        if self.inner.config.is_unbounded() {
            self.inner.state.lock().expect("pool mutex poisoned").in_flight += 1;
            return Ok(());
        }

        let rx = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.in_flight < self.inner.config.limit {
                state.in_flight += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        let Some(rx) = rx else {
            return Ok(());
        };

        tokio::select! {
            biased;
            _ = scope.cancelled() => Err(Error::Cancelled),
            res = rx => res.map_err(|_| Error::Cancelled),
        }
    }

    /// Whether `self` and `other` are the same pool (same underlying admission
    /// state), used by [`crate::Job`] to reject a pool that was never passed
    /// to [`crate::Job::new`].
    pub(crate) fn ptr_eq(&self, other: &Pool) -> bool {
        std::sync::Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Releases the slot reserved by a prior successful [`Pool::admit`],
    /// handing it directly to the next waiter if one is queued.
    pub(crate) fn release(&self) {
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if self.inner.config.is_unbounded() {
            state.in_flight -= 1;
            return;
        }
        if !wake_front(&mut state.waiters) {
            state.in_flight -= 1;
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.label())
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::ScopeKind;
    use crate::timer_pool::TimerPool;
    use tokio_util::sync::CancellationToken;

    fn root_scope() -> Scope {
        Scope::root(CancellationToken::new(), TimerPool::new())
    }

    #[tokio::test]
    async fn admits_immediately_under_limit() {
        let pool = Pool::new(PoolConfig::bounded("p", 2));
        let scope = root_scope();
        pool.admit(&scope).await.unwrap();
        assert_eq!(pool.in_flight(), 1);
        pool.admit(&scope).await.unwrap();
        assert_eq!(pool.in_flight(), 2);
    }

    #[tokio::test]
    async fn serializes_at_limit_one() {
        let pool = Pool::new(PoolConfig::bounded("p", 1));
        let scope = root_scope();
        pool.admit(&scope).await.unwrap();
        assert_eq!(pool.in_flight(), 1);

        let pool2 = pool.clone();
        let scope2 = scope.child(ScopeKind::Root);
        let waiter = tokio::spawn(async move { pool2.admit(&scope2).await });
        tokio::task::yield_now().await;
        assert_eq!(pool.queued(), 1);

        pool.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_forwards_slot() {
        let pool = Pool::new(PoolConfig::bounded("p", 1));
        let scope = root_scope();
        pool.admit(&scope).await.unwrap();

        let doomed_scope = scope.child(ScopeKind::Root);
        let doomed_token = doomed_scope.token().clone();
        let pool2 = pool.clone();
        let doomed = tokio::spawn(async move { pool2.admit(&doomed_scope).await });
        tokio::task::yield_now().await;

        let survivor_scope = scope.child(ScopeKind::Root);
        let pool3 = pool.clone();
        let survivor = tokio::spawn(async move { pool3.admit(&survivor_scope).await });
        tokio::task::yield_now().await;

        doomed_token.cancel();
        assert!(matches!(doomed.await.unwrap(), Err(Error::Cancelled)));

        pool.release();
        survivor.await.unwrap().unwrap();
        assert_eq!(pool.in_flight(), 1);
    }

    #[tokio::test]
    async fn unbounded_pool_never_blocks() {
        let pool = Pool::new(PoolConfig::unbounded("p"));
        let scope = root_scope();
        for _ in 0..1000 {
            pool.admit(&scope).await.unwrap();
        }
        assert_eq!(pool.in_flight(), 1000);
    }

    #[tokio::test]
    #[should_panic(expected = "already bound")]
    async fn double_bind_panics() {
        let pool = Pool::new(PoolConfig::bounded("p", 1));
        pool.bind();
        pool.bind();
    }
}
