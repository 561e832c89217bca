//! Context plumbing shared by the job root, task bodies, and gather
//! closures.
//!
//! The data model calls for "a task context... tagged so the dispatcher
//! can detect misuse" (scatter called from inside a task body). Rather
//! than giving `TaskContext` and `GatherContext` unrelated types — which
//! would need a trait object or an enum at every `scatter` call site
//! anyway, since a job's root scope, a gather closure's scope, and (if
//! misused) a task's own scope must all be acceptable-or-rejected by the
//! same runtime check — this crate uses one `Scope` type for all three
//! roles and tags it with a `ScopeKind`. `TaskContext` and `GatherContext`
//! are the names callers see in signatures; both are this same type.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::timer_pool::TimerPool;

/// Which role a [`Scope`] is playing. Only `scatter`'s pre-flight check
/// looks at this; everything else treats a `Scope` uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    /// The job's own root scope, or a caller-derived descendant of it
    /// that was never handed to a task body.
    Root,
    /// Handed to a running task's body. `scatter` rejects this kind.
    Task,
    /// Handed to a gather closure. Scattering from here is how a
    /// completion fans out its successors.
    Gather,
}

/// A node in the job's cancellation tree, carrying enough identity for
/// `scatter` to detect and reject the one disallowed call pattern:
/// scattering from inside a task's own body.
#[derive(Clone)]
pub struct Scope {
    token: CancellationToken,
    kind: ScopeKind,
    timers: TimerPool,
}

/// The scope handed to a running task body. See [`Scope`].
pub type TaskContext = Scope;

/// The scope handed to a gather closure. See [`Scope`].
pub type GatherContext = Scope;

impl Scope {
    pub(crate) fn root(token: CancellationToken, timers: TimerPool) -> Self {
        Self {
            token,
            kind: ScopeKind::Root,
            timers,
        }
    }

    /// A standalone root scope with its own cancellation tree, unrelated to
    /// any [`crate::Job`]. Useful for bounding a call to
    /// [`crate::Job::finish`] or [`crate::Job::gather`] with a timeout that
    /// is independent of the job's own cancellation (§4.2: "`Finish` honors
    /// its own ctx argument independently").
    pub fn new() -> Self {
        Self::root(CancellationToken::new(), TimerPool::new())
    }

    /// Cancels this scope and everything derived from it via [`Scope::child`].
    /// Has no effect on an ancestor scope this one was derived from.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn child(&self, kind: ScopeKind) -> Self {
        Self {
            token: self.token.child_token(),
            kind,
            timers: self.timers.clone(),
        }
    }

    pub(crate) fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this scope, or any ancestor, has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this scope, or any ancestor, is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleeps for `duration`, drawing a reusable timer from the job's
    /// shared timer pool (§4.9/§9). Resolves early, before `duration`
    /// elapses, if the scope is cancelled while sleeping.
    pub async fn sleep(&self, duration: Duration) {
        let timer = self.timers.acquire(duration);
        tokio::select! {
            _ = timer => {}
            _ = self.token.cancelled() => {}
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_scope_observes_parent_cancel() {
        let parent = Scope::root(CancellationToken::new(), TimerPool::new());
        let child = parent.child(ScopeKind::Task);
        assert!(!child.is_cancelled());
        parent.token().cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_returns_early_on_cancel() {
        let parent = Scope::root(CancellationToken::new(), TimerPool::new());
        let child = parent.child(ScopeKind::Task);
        let token = parent.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel();
        });
        let start = tokio::time::Instant::now();
        child.sleep(Duration::from_secs(60)).await;
        assert!(tokio::time::Instant::now() - start < Duration::from_secs(1));
    }
}
