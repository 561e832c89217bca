//! Cooperative pre-drain hook invoked before a scatter admits against a
//! pool (§4.5). Keeps a tight scatter loop against an unbounded pool from
//! piling up completed-but-ungathered tasks indefinitely, and smooths
//! throughput when gathering would otherwise starve behind a burst of
//! scatters.

use crate::ctx::Scope;
use crate::job::Job;

/// Performs up to `job`'s configured [`JobConfig::backpressure_yields`] bare,
/// non-blocking gather attempts, stopping early if `ctx` cancels or an
/// attempt finds nothing queued.
///
/// [`JobConfig::backpressure_yields`]: crate::config::JobConfig::backpressure_yields
pub(crate) async fn yield_before_scatter(job: &Job, ctx: &Scope) {
    for _ in 0..job.config().backpressure_yields {
        if ctx.is_cancelled() {
            break;
        }
        // A single cooperative scheduling point per attempt, so a tight
        // scatter loop still yields to the runtime even when there is
        // nothing to gather yet.
        tokio::task::yield_now().await;
        match job.gather_one_nonblocking().await {
            Ok(true) => continue,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::envelope::Outcome;
    use crate::error::StringError;
    use crate::job::Job;
    use crate::pool::Pool;

    #[tokio::test]
    async fn pre_drain_consumes_a_completed_task_before_scatter_blocks() {
        let pool = Pool::new(PoolConfig::bounded("p", 1));
        let job = Job::new([pool.clone()]);
        let ctx = job.scope();

        job.scatter(
            &ctx,
            &pool,
            |_ctx| async { Ok::<u32, StringError>(7) },
            move |_ctx, outcome: Outcome<u32, StringError>| async move {
                assert!(matches!(outcome, Outcome::Value(7)));
                Ok::<(), StringError>(())
            },
        )
        .await
        .unwrap();

        // Give the spawned task a chance to run to completion and post its
        // envelope before the pre-drain gets a chance to observe it.
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        assert_eq!(job.outstanding(), 1);
        yield_before_scatter(&job, &ctx).await;
        assert_eq!(job.outstanding(), 0);
    }
}
