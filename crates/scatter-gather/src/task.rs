//! The per-task spawned body: cancellation checks, panic recovery, and
//! post-result routing, in the order §4.4 requires — the pool slot is
//! released *before* the completion envelope reaches the gather channel, so
//! a gather closure can scatter back into the same pool without deadlock.

use std::future::Future;

use crate::ctx::{GatherContext, Scope, TaskContext};
use crate::envelope::{Outcome, PanicMessage};
use crate::error::BoxError;
use crate::events::JobEvent;
use crate::job::{BoxFuture, GatherInvocation, Job};
use crate::pool::Pool;

/// Runs one scattered task to completion and routes its result. Spawned
/// directly by [`Job::scatter`] once the pool has admitted it.
pub(crate) async fn run<V, E, Fut, TaskFn, GatherFn, GFut, GErr>(
    job: Job,
    pool: Pool,
    task_scope: Scope,
    gather_scope: GatherContext,
    task_fn: TaskFn,
    gather_fn: GatherFn,
) where
    V: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
    TaskFn: FnOnce(TaskContext) -> Fut + Send + 'static,
    GatherFn: FnOnce(GatherContext, Outcome<V, E>) -> GFut + Send + 'static,
    GFut: Future<Output = Result<(), GErr>> + Send + 'static,
    GErr: std::error::Error + Send + Sync + 'static,
{
    let pool_label = pool.label().to_string();
    job.emit(JobEvent::TaskStarted {
        pool: pool_label.clone(),
    });

    let outcome: Outcome<V, E> = if task_scope.is_cancelled() {
        Outcome::Cancelled
    } else {
        // Run the user's task function on its own spawned task so a panic
        // inside it surfaces as a `JoinError` rather than unwinding through
        // this body — the only way to recover it without `catch_unwind`
        // (which doesn't compose with crossing `.await` points here).
        let inner_scope = task_scope.clone();
        let handle = tokio::spawn(async move { task_fn(inner_scope).await });
        match handle.await {
            Ok(Ok(value)) => Outcome::Value(value),
            Ok(Err(err)) => Outcome::Failed(err),
            Err(join_err) if join_err.is_panic() => {
                Outcome::Panicked(PanicMessage::from_payload(join_err.into_panic()))
            }
            Err(_aborted) => Outcome::Cancelled,
        }
    };

    job.emit(JobEvent::TaskFinished {
        pool: pool_label,
        outcome: outcome.kind(),
    });

    // Release the admission slot before the envelope is even constructed,
    // let alone routed: this is what lets a gather closure for this task
    // scatter a successor into the same pool without deadlocking on its own
    // predecessor's slot.
    pool.release();

    let invocation: GatherInvocation = Box::new(move || {
        Box::pin(async move {
            gather_fn(gather_scope, outcome)
                .await
                .map_err(|err| Box::new(err) as BoxError)
        }) as BoxFuture<Result<(), BoxError>>
    });
    job.post_result(invocation);
}
