//! The unit-of-work root: owns a set of bound [`Pool`]s, the outstanding-task
//! counter, the single-consumer gather channel, cancellation, and the
//! `open → closing → done` state machine (§4.2).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::backpressure;
use crate::config::{JobConfig, UNBOUNDED};
use crate::ctx::{GatherContext, Scope, ScopeKind, TaskContext};
use crate::envelope::Outcome;
use crate::error::{BoxError, Error, StringError};
use crate::events::{JobEvent, JobState, PoolSnapshot, StatusSnapshot};
use crate::pool::Pool;
use crate::task;
use crate::timer_pool::TimerPool;

/// A boxed future yielded by a [`GatherInvocation`].
pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A boxed, fully self-contained invocation of one task's gather closure:
/// closes over the user's `gather_fn`, the task's [`Outcome`], and the
/// task's own [`GatherContext`], so the consumer (`Job::gather_one`/`finish`)
/// never needs to know the task's concrete `V`/`E` (§9's monomorphize-the-
/// hot-path, box-only-at-the-shared-channel note). Yields a future rather
/// than running synchronously because the one legal way to enqueue a
/// successor — scattering from inside a gather closure — must be able to
/// `.await` admission, which a plain synchronous closure cannot do.
pub(crate) type GatherInvocation = Box<dyn FnOnce() -> BoxFuture<Result<(), BoxError>> + Send>;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_DONE: u8 = 2;

fn decode_state(raw: u8) -> JobState {
    match raw {
        STATE_OPEN => JobState::Open,
        STATE_CLOSING => JobState::Closing,
        _ => JobState::Done,
    }
}

struct JobInner {
    token: CancellationToken,
    timers: TimerPool,
    pools: Vec<Pool>,
    outstanding: AtomicI64,
    state: AtomicU8,
    /// First gather-closure failure observed, by message. Kept as a string
    /// rather than the original `BoxError` since the original is already
    /// returned directly to whichever `gather_one`/`finish` call first saw
    /// it (§4.8); this slot only needs to answer "was there one" later.
    failure: std::sync::Mutex<Option<String>>,
    gather_tx: mpsc::UnboundedSender<GatherInvocation>,
    gather_rx: AsyncMutex<mpsc::UnboundedReceiver<GatherInvocation>>,
    events_tx: broadcast::Sender<JobEvent>,
    snapshot_rx: watch::Receiver<StatusSnapshot>,
    snapshot_tx: watch::Sender<StatusSnapshot>,
    done_notify: Notify,
    config: JobConfig,
}

/// The scatter/gather execution root (§3, §4.2). Cheap to clone: internally
/// an `Arc`, the way `EngineHandle` wraps `Arc<EngineInner>` in the teacher
/// crate.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Creates a job with default [`JobConfig`], binding `pools`. Panics if
    /// any pool was already bound to a different job (§4.2).
    pub fn new(pools: impl IntoIterator<Item = Pool>) -> Self {
        Self::with_config(pools, JobConfig::default())
    }

    /// Creates a job with an explicit [`JobConfig`], binding `pools` and
    /// deriving its root cancellation from a fresh, independent token.
    pub fn with_config(pools: impl IntoIterator<Item = Pool>, config: JobConfig) -> Self {
        Self::new_inner(CancellationToken::new(), pools, config)
    }

    /// Creates a job whose root cancellation is a child of `parent`: canceling
    /// `parent` cancels this job (and everything it scatters), matching
    /// `NewJob(parentCtx, pools…)` (§4.2).
    pub fn child_of(
        parent: &CancellationToken,
        pools: impl IntoIterator<Item = Pool>,
        config: JobConfig,
    ) -> Self {
        Self::new_inner(parent.child_token(), pools, config)
    }

    fn new_inner(token: CancellationToken, pools: impl IntoIterator<Item = Pool>, config: JobConfig) -> Self {
        let pools: Vec<Pool> = pools.into_iter().collect();
        for pool in &pools {
            pool.bind();
        }

        let (gather_tx, gather_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity);
        let initial_snapshot = StatusSnapshot {
            state: JobState::Open,
            outstanding: 0,
            pools: pools
                .iter()
                .map(|p| PoolSnapshot {
                    label: p.label().to_string(),
                    limit: if p.limit() == UNBOUNDED { None } else { Some(p.limit()) },
                    in_flight: 0,
                    queued: 0,
                })
                .collect(),
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial_snapshot);

        Self {
            inner: Arc::new(JobInner {
                token,
                timers: TimerPool::new(),
                pools,
                outstanding: AtomicI64::new(0),
                state: AtomicU8::new(STATE_OPEN),
                failure: std::sync::Mutex::new(None),
                gather_tx,
                gather_rx: AsyncMutex::new(gather_rx),
                events_tx,
                snapshot_rx,
                snapshot_tx,
                done_notify: Notify::new(),
                config,
            }),
        }
    }

    /// A fresh [`Scope`] descending from this job's root, suitable as the
    /// `ctx` argument to a top-level [`Job::scatter`] call (one not made
    /// from inside a gather closure).
    pub fn scope(&self) -> Scope {
        Scope::root(self.inner.token.child_token(), self.inner.timers.clone())
    }

    /// The job's current lifecycle state.
    pub fn state(&self) -> JobState {
        decode_state(self.inner.state.load(Ordering::SeqCst))
    }

    /// Tasks scattered but not yet gathered.
    pub fn outstanding(&self) -> i64 {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Subscribes to this job's [`JobEvent`] stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events_tx.subscribe()
    }

    /// The job's current [`StatusSnapshot`].
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// Cancels the job's root context. Idempotent. Every task context
    /// derived from this job observes the cancellation at its next
    /// cooperative check (§5). Advances the job to at least `closing` so
    /// subsequent scatters are rejected, but does *not* drain outstanding
    /// tasks itself — pair with a concurrent [`Job::finish`] or
    /// [`Job::cancel_and_wait`] to do that.
    pub fn cancel(&self) {
        self.inner.token.cancel();
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.emit(JobEvent::StateChanged { state: JobState::Closing });
            self.publish_snapshot();
        }
    }

    /// Cancels the job, then blocks until it reaches `done`. Safe to call
    /// more than once, and safe as a deferred cleanup. Does not itself drain
    /// the gather channel: some other caller (typically a concurrent
    /// [`Job::finish`]) must be invoking gathers for the job to ever reach
    /// `done`.
    pub async fn cancel_and_wait(&self) {
        self.cancel();
        loop {
            if self.state() == JobState::Done {
                return;
            }
            let notified = self.inner.done_notify.notified();
            if self.state() == JobState::Done {
                return;
            }
            notified.await;
        }
    }

    /// Enqueues a task and its gather continuation (§4.3).
    ///
    /// Panics (programmer misuse, §7.1) if `ctx` is a task's own scope — a
    /// task body must never scatter directly; scatter from the job's root
    /// scope or from a gather closure instead — or if `pool` was never
    /// bound to this job via [`Job::new`]/[`Job::with_config`].
    ///
    /// Returns [`Error::JobClosing`]/[`Error::JobDone`] if the job is no
    /// longer accepting scatters, or [`Error::Cancelled`] if `ctx` (or the
    /// job) is canceled while queued for admission.
    pub async fn scatter<V, E, Fut, TaskFn, GErr, GFut, GatherFn>(
        &self,
        ctx: &Scope,
        pool: &Pool,
        task_fn: TaskFn,
        gather_fn: GatherFn,
    ) -> Result<(), Error>
    where
        V: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        TaskFn: FnOnce(TaskContext) -> Fut + Send + 'static,
        GErr: std::error::Error + Send + Sync + 'static,
        GFut: Future<Output = Result<(), GErr>> + Send + 'static,
        GatherFn: FnOnce(GatherContext, Outcome<V, E>) -> GFut + Send + 'static,
    {
        assert!(
            ctx.kind() != ScopeKind::Task,
            "scatter called from inside a task body; scatter only from the job's root scope, or from a gather closure"
        );
        assert!(
            self.owns_pool(pool),
            "pool {:?} was never bound to this job (pass it to Job::new/Job::with_config)",
            pool.label()
        );

        match self.state() {
            JobState::Closing => return Err(Error::JobClosing),
            JobState::Done => return Err(Error::JobDone),
            JobState::Open => {}
        }

        backpressure::yield_before_scatter(self, ctx).await;

        self.increment_tasks();
        self.emit(JobEvent::TaskScattered { pool: pool.label().to_string() });

        self.emit(JobEvent::PoolAdmissionQueued { pool: pool.label().to_string() });
        if let Err(err) = pool.admit(ctx).await {
            self.after_decrement(self.decrement_tasks());
            self.emit(JobEvent::ScatterRejected { reason: err.to_string() });
            return Err(err);
        }
        self.emit(JobEvent::PoolAdmissionGranted { pool: pool.label().to_string() });

        let task_scope = ctx.child(ScopeKind::Task);
        let gather_scope = ctx.child(ScopeKind::Gather);
        let job = self.clone();
        let pool = pool.clone();
        tokio::spawn(task::run(job, pool, task_scope, gather_scope, task_fn, gather_fn));

        Ok(())
    }

    /// Blocks until one completion envelope is available (or `ctx`
    /// cancels), then invokes its gather closure. Unlike [`Job::gather_one`],
    /// this does not check `outstanding` first — calling it with nothing
    /// left to gather blocks forever, so prefer `gather_one` in a drain loop.
    pub async fn gather(&self, ctx: &Scope) -> Result<(), Error> {
        match self.recv_blocking(ctx).await? {
            Some(invocation) => self.invoke(invocation).await,
            None => Ok(()),
        }
    }

    /// Like [`Job::gather`], but returns `Ok(false)` immediately, without
    /// blocking, if `outstanding` is already zero (nothing will ever arrive).
    /// Otherwise blocks for the next envelope and returns `Ok(true)` after
    /// invoking it (or the gather closure's own error).
    pub async fn gather_one(&self, ctx: &Scope) -> Result<bool, Error> {
        if self.outstanding() == 0 {
            return Ok(false);
        }
        match self.recv_blocking(ctx).await? {
            Some(invocation) => {
                self.invoke(invocation).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Non-blocking variant of [`Job::gather_one`], used by the backpressure
    /// coordinator's pre-drain (§4.5) and available to callers who want to
    /// opportunistically drain without ever suspending admission-wise. The
    /// popped gather closure itself may still `.await` (e.g. to scatter a
    /// successor), so this is non-blocking only with respect to the gather
    /// channel, not the closure it runs.
    pub async fn gather_one_nonblocking(&self) -> Result<bool, Error> {
        if self.outstanding() == 0 {
            return Ok(false);
        }
        match self.try_recv() {
            Some(invocation) => {
                self.invoke(invocation).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves the job to `closing` (if still `open`), then repeatedly gathers
    /// until `outstanding` reaches zero or `ctx` cancels, returning the first
    /// gather-closure error observed (draining continues after one, §4.8
    /// open question (b)) or `ctx`'s cancellation error. Always leaves the
    /// job `done` before returning.
    pub async fn finish(&self, ctx: &Scope) -> Result<(), Error> {
        self.transition_to_closing();
        loop {
            match self.gather_one(ctx).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(Error::Cancelled) => break,
                Err(Error::Gather(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        self.finalize_done();
        self.terminal_result(ctx)
    }

    /// Alias for [`Job::finish`] (§9 open question (c): treated as
    /// synonyms, since nothing in this crate's behavior distinguishes them).
    pub async fn close_and_gather_all(&self, ctx: &Scope) -> Result<(), Error> {
        self.finish(ctx).await
    }

    fn owns_pool(&self, pool: &Pool) -> bool {
        self.inner.pools.iter().any(|p| p.ptr_eq(pool))
    }

    fn increment_tasks(&self) {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.publish_snapshot();
    }

    fn decrement_tasks(&self) -> i64 {
        let prev = self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "outstanding-tasks went negative");
        prev - 1
    }

    /// Common bookkeeping after any decrement: refresh the snapshot, and if
    /// this decrement is the one that drained the last outstanding task
    /// while `closing`, advance straight to `done` (§4.2: "`DecrementTasks`
    /// is also the signal ... reaching zero while `closing` transitions the
    /// job to `done`").
    fn after_decrement(&self, new_outstanding: i64) {
        self.publish_snapshot();
        if new_outstanding == 0
            && self
                .inner
                .state
                .compare_exchange(STATE_CLOSING, STATE_DONE, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.emit(JobEvent::StateChanged { state: JobState::Done });
            self.inner.done_notify.notify_waiters();
            self.publish_snapshot();
        }
    }

    fn transition_to_closing(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.emit(JobEvent::StateChanged { state: JobState::Closing });
            self.publish_snapshot();
        }
    }

    /// Unconditionally marks the job `done`. Called at the end of
    /// [`Job::finish`] even when its drain loop stopped early because `ctx`
    /// canceled rather than because `outstanding` reached zero — a caller
    /// that bounds `finish`'s draining time accepts that some tasks may
    /// still be in flight when it returns (§9 open questions).
    fn finalize_done(&self) {
        let prev = self.inner.state.swap(STATE_DONE, Ordering::SeqCst);
        if prev != STATE_DONE {
            self.emit(JobEvent::StateChanged { state: JobState::Done });
            self.inner.done_notify.notify_waiters();
            self.publish_snapshot();
        }
    }

    fn terminal_result(&self, ctx: &Scope) -> Result<(), Error> {
        let failed = self.inner.failure.lock().expect("job failure slot poisoned").clone();
        if let Some(msg) = failed {
            return Err(Error::gather(Box::new(StringError(msg))));
        }
        if ctx.is_cancelled() || self.inner.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn recv_blocking(&self, ctx: &Scope) -> Result<Option<GatherInvocation>, Error> {
        let mut rx = self.inner.gather_rx.lock().await;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::Cancelled),
            item = rx.recv() => Ok(item),
        }
    }

    fn try_recv(&self) -> Option<GatherInvocation> {
        let mut rx = self.inner.gather_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    async fn invoke(&self, invocation: GatherInvocation) -> Result<(), Error> {
        let result = invocation().await;
        match &result {
            Ok(()) => self.emit(JobEvent::GatherInvoked { error: None }),
            Err(err) => {
                let msg = err.to_string();
                self.emit(JobEvent::GatherInvoked { error: Some(msg.clone()) });
                let mut slot = self.inner.failure.lock().expect("job failure slot poisoned");
                if slot.is_none() {
                    *slot = Some(msg);
                }
            }
        }
        self.after_decrement(self.decrement_tasks());
        result.map_err(Error::gather)
    }

    pub(crate) fn config(&self) -> &JobConfig {
        &self.inner.config
    }

    pub(crate) fn post_result(&self, invocation: GatherInvocation) {
        // The receiver only ever drops once the Job itself is dropped, at
        // which point nothing will call `finish`/`gather*` again either;
        // a send error here just means the caller stopped listening.
        let _ = self.inner.gather_tx.send(invocation);
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    fn publish_snapshot(&self) {
        let snapshot = StatusSnapshot {
            state: self.state(),
            outstanding: self.outstanding(),
            pools: self
                .inner
                .pools
                .iter()
                .map(|p| PoolSnapshot {
                    label: p.label().to_string(),
                    limit: if p.limit() == UNBOUNDED { None } else { Some(p.limit()) },
                    in_flight: p.in_flight(),
                    queued: p.queued(),
                })
                .collect(),
        };
        let _ = self.inner.snapshot_tx.send(snapshot);
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::StringError;

    #[tokio::test]
    async fn finish_on_zero_scatters_returns_ok_immediately() {
        let job = Job::new([Pool::new(PoolConfig::bounded("p", 1))]);
        let ctx = job.scope();
        assert_eq!(job.finish(&ctx).await.unwrap(), ());
        assert_eq!(job.state(), JobState::Done);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let job = Job::new([Pool::new(PoolConfig::bounded("p", 1))]);
        job.cancel();
        job.cancel();
        assert_eq!(job.state(), JobState::Closing);
    }

    #[tokio::test]
    async fn scatter_after_finish_returns_terminal_error() {
        let job = Job::new([Pool::new(PoolConfig::bounded("p", 1))]);
        let ctx = job.scope();
        job.finish(&ctx).await.unwrap();

        let err = job
            .scatter(
                &ctx,
                &job.inner.pools[0].clone(),
                |_ctx| async { Ok::<(), StringError>(()) },
                |_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobDone));
    }

    #[tokio::test]
    #[should_panic(expected = "never bound to this job")]
    async fn scatter_with_foreign_pool_panics() {
        let job = Job::new([Pool::new(PoolConfig::bounded("p", 1))]);
        let foreign = Pool::new(PoolConfig::bounded("foreign", 1));
        let ctx = job.scope();
        let _ = job
            .scatter(
                &ctx,
                &foreign,
                |_ctx| async { Ok::<(), StringError>(()) },
                |_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
            )
            .await;
    }

    #[tokio::test]
    async fn close_and_gather_all_is_an_alias_for_finish() {
        let pool = Pool::new(PoolConfig::bounded("p", 1));
        let job = Job::new([pool.clone()]);
        let ctx = job.scope();

        job.scatter(
            &ctx,
            &pool,
            |_ctx| async { Ok::<u32, StringError>(1) },
            |_ctx, _outcome: Outcome<u32, StringError>| async { Ok::<(), StringError>(()) },
        )
        .await
        .unwrap();

        job.close_and_gather_all(&ctx).await.unwrap();
        assert_eq!(job.state(), JobState::Done);
        assert_eq!(job.outstanding(), 0);
    }

    #[tokio::test]
    async fn snapshot_reflects_pool_and_outstanding_counts() {
        let pool = Pool::new(PoolConfig::bounded("p", 3));
        let job = Job::new([pool.clone()]);
        let ctx = job.scope();

        let before = job.snapshot();
        assert_eq!(before.state, JobState::Open);
        assert_eq!(before.outstanding, 0);
        assert_eq!(before.pools.len(), 1);
        assert_eq!(before.pools[0].label, "p");
        assert_eq!(before.pools[0].limit, Some(3));

        job.scatter(
            &ctx,
            &pool,
            |_ctx| async { Ok::<(), StringError>(()) },
            |_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
        )
        .await
        .unwrap();

        job.finish(&ctx).await.unwrap();
        let after = job.snapshot();
        assert_eq!(after.state, JobState::Done);
        assert_eq!(after.outstanding, 0);
    }
}
