//! End-to-end scatter/gather scenarios, exercising `Job`/`Pool` the way a
//! caller actually would rather than unit-testing their internals directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use scatter_gather::{Error, Job, JobEvent, JobState, Outcome, Pool, PoolConfig, StringError};

fn single_pool(limit: usize) -> Pool {
    Pool::new(PoolConfig::bounded("p", limit))
}

/// Root scatter runs A; A's gather scatters B; B's gather scatters C.
/// With pool limit 1 this is fully serialized, so the three gathers must
/// land in scatter order.
#[tokio::test]
async fn sequential_chain_runs_in_order() {
    let pool = single_pool(1);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let job_b = job.clone();
    let pool_b = pool.clone();
    let order_a = order.clone();
    job.scatter(
        &ctx,
        &pool,
        |_task_ctx| async { Ok::<&'static str, StringError>("A") },
        move |gather_ctx, outcome: Outcome<&'static str, StringError>| async move {
            if let Outcome::Value(name) = outcome {
                order_a.lock().expect("order mutex poisoned").push(name);
            }
            let job_c = job_b.clone();
            let pool_c = pool_b.clone();
            let order_b = order_a.clone();
            job_b
                .scatter(
                    &gather_ctx,
                    &pool_b,
                    |_task_ctx| async { Ok::<&'static str, StringError>("B") },
                    move |gather_ctx, outcome: Outcome<&'static str, StringError>| async move {
                        if let Outcome::Value(name) = outcome {
                            order_b.lock().expect("order mutex poisoned").push(name);
                        }
                        let order_c = order_b.clone();
                        job_c
                            .scatter(
                                &gather_ctx,
                                &pool_c,
                                |_task_ctx| async { Ok::<&'static str, StringError>("C") },
                                move |_gather_ctx, outcome: Outcome<&'static str, StringError>| async move {
                                    if let Outcome::Value(name) = outcome {
                                        order_c.lock().expect("order mutex poisoned").push(name);
                                    }
                                    Ok::<(), StringError>(())
                                },
                            )
                            .await
                            .unwrap();
                        Ok::<(), StringError>(())
                    },
                )
                .await
                .unwrap();
            Ok::<(), StringError>(())
        },
    )
    .await
    .unwrap();

    job.finish(&ctx).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(job.state(), JobState::Done);
}

/// Ten root scatters fan out against a pool of 4; their gather closures
/// fan back in to a shared accumulator. The single-consumer gather
/// guarantee means the accumulator needs no locking beyond what Rust's
/// aliasing rules already force on a bare `Cell`-like counter; a plain
/// `Mutex` is used here only because the closure is `'static` and boxed,
/// not because concurrent access is possible.
#[tokio::test]
async fn fan_out_then_fan_in_sums_correctly() {
    let pool = single_pool(4);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let sum = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..10usize {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        let sum = sum.clone();
        job.scatter(
            &ctx,
            &pool,
            move |_task_ctx| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<usize, StringError>(i)
                }
            },
            move |_gather_ctx, outcome: Outcome<usize, StringError>| {
                let sum = sum.clone();
                async move {
                    if let Outcome::Value(v) = outcome {
                        sum.fetch_add(v, Ordering::SeqCst);
                    }
                    Ok::<(), StringError>(())
                }
            },
        )
        .await
        .unwrap();
    }

    job.finish(&ctx).await.unwrap();

    assert_eq!(sum.load(Ordering::SeqCst), 45);
    assert!(peak.load(Ordering::SeqCst) <= 4);
    assert_eq!(job.state(), JobState::Done);
}

/// Cancelling mid-flight stops `Finish`'s own drain loop with a cancel
/// error (its `ctx` is a child of the job's root token), while the pool
/// itself still converges back to zero in-flight as already-dispatched
/// tasks observe the cancellation and return.
#[tokio::test]
async fn cancellation_mid_flight_stops_finish_with_cancelled_error() {
    let pool = single_pool(2);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let scatter_job = job.clone();
    let scatter_pool = pool.clone();
    let scatter_ctx = ctx.clone();
    let scatter_handle = tokio::spawn(async move {
        for _ in 0..100 {
            let res = scatter_job
                .scatter(
                    &scatter_ctx,
                    &scatter_pool,
                    |task_ctx| async move {
                        task_ctx.sleep(Duration::from_millis(40)).await;
                        Ok::<bool, StringError>(task_ctx.is_cancelled())
                    },
                    |_gather_ctx, _outcome: Outcome<bool, StringError>| async {
                        Ok::<(), StringError>(())
                    },
                )
                .await;
            if res.is_err() {
                break;
            }
        }
    });

    let finish_job = job.clone();
    let finish_ctx = ctx.clone();
    let finish_handle = tokio::spawn(async move { finish_job.finish(&finish_ctx).await });

    tokio::time::sleep(Duration::from_millis(5)).await;
    job.cancel_and_wait().await;

    let finish_result = finish_handle.await.expect("finish task panicked");
    assert!(matches!(finish_result, Err(Error::Cancelled)));
    assert_eq!(job.state(), JobState::Done);

    let _ = scatter_handle.await;

    // Already-admitted tasks release their slot on the way out even though
    // nobody is left gathering them; the pool itself never wedges.
    for _ in 0..50 {
        if pool.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.in_flight(), 0);
}

/// A task panic is delivered to its gather closure as
/// `Outcome::Panicked`, not propagated as a Rust panic; the job keeps
/// running afterward.
#[tokio::test]
async fn task_panic_is_delivered_as_outcome_and_job_continues() {
    let pool = single_pool(4);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let saw_panic = Arc::new(Mutex::new(None));
    let saw_panic2 = saw_panic.clone();
    job.scatter(
        &ctx,
        &pool,
        |_task_ctx| async { panic!("deliberate task failure") },
        move |_gather_ctx, outcome: Outcome<(), StringError>| {
            let saw_panic2 = saw_panic2.clone();
            async move {
                *saw_panic2.lock().unwrap() = Some(outcome.kind());
                Ok::<(), StringError>(())
            }
        },
    )
    .await
    .unwrap();

    // A sibling, well-behaved task scattered afterward still completes.
    let sibling_ran = Arc::new(Mutex::new(false));
    let sibling_ran2 = sibling_ran.clone();
    job.scatter(
        &ctx,
        &pool,
        |_task_ctx| async { Ok::<(), StringError>(()) },
        move |_gather_ctx, outcome: Outcome<(), StringError>| {
            let sibling_ran2 = sibling_ran2.clone();
            async move {
                *sibling_ran2.lock().unwrap() = matches!(outcome, Outcome::Value(()));
                Ok::<(), StringError>(())
            }
        },
    )
    .await
    .unwrap();

    job.finish(&ctx).await.unwrap();

    assert_eq!(*saw_panic.lock().unwrap(), Some(scatter_gather::OutcomeKind::Panicked));
    assert!(*sibling_ran.lock().unwrap());
    assert_eq!(job.state(), JobState::Done);
}

/// One gather closure out of ten returns an error; `Finish` surfaces that
/// error, but draining still continues for the other nine.
#[tokio::test]
async fn gather_error_propagates_but_draining_continues() {
    let pool = single_pool(4);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let invocations = Arc::new(AtomicUsize::new(0));

    for i in 0..10usize {
        let invocations = invocations.clone();
        job.scatter(
            &ctx,
            &pool,
            move |_task_ctx| async move { Ok::<usize, StringError>(i) },
            move |_gather_ctx, outcome: Outcome<usize, StringError>| {
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    if let Outcome::Value(3) = outcome {
                        return Err(StringError("gather closure #3 failed".into()));
                    }
                    Ok::<(), StringError>(())
                }
            },
        )
        .await
        .unwrap();
    }

    let result = job.finish(&ctx).await;
    assert!(matches!(result, Err(Error::Gather(_))));
    assert_eq!(invocations.load(Ordering::SeqCst), 10);
    assert_eq!(job.state(), JobState::Done);
}

/// Scattering from inside a task body is the one disallowed call pattern.
/// Because task bodies run on their own spawned task, the misuse panic
/// surfaces to its gather closure as `Outcome::Panicked` rather than
/// unwinding into the test harness; a sibling task scattered alongside it
/// is unaffected.
#[tokio::test]
async fn scatter_from_task_body_panics_without_corrupting_the_job() {
    let pool = single_pool(4);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();

    let misuse_outcome = Arc::new(Mutex::new(None));
    let misuse_outcome2 = misuse_outcome.clone();
    let misuse_job = job.clone();
    let misuse_pool = pool.clone();
    job.scatter(
        &ctx,
        &pool,
        move |task_ctx| {
            let misuse_job = misuse_job.clone();
            let misuse_pool = misuse_pool.clone();
            async move {
                let _ = misuse_job
                    .scatter(
                        &task_ctx,
                        &misuse_pool,
                        |_ctx| async { Ok::<(), StringError>(()) },
                        |_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
                    )
                    .await;
                Ok::<(), StringError>(())
            }
        },
        move |_gather_ctx, outcome: Outcome<(), StringError>| {
            let misuse_outcome2 = misuse_outcome2.clone();
            async move {
                *misuse_outcome2.lock().unwrap() = Some(outcome.kind());
                Ok::<(), StringError>(())
            }
        },
    )
    .await
    .unwrap();

    let sibling_ok = Arc::new(Mutex::new(false));
    let sibling_ok2 = sibling_ok.clone();
    job.scatter(
        &ctx,
        &pool,
        |_task_ctx| async { Ok::<(), StringError>(()) },
        move |_gather_ctx, outcome: Outcome<(), StringError>| {
            let sibling_ok2 = sibling_ok2.clone();
            async move {
                *sibling_ok2.lock().unwrap() = matches!(outcome, Outcome::Value(()));
                Ok::<(), StringError>(())
            }
        },
    )
    .await
    .unwrap();

    job.finish(&ctx).await.unwrap();

    assert_eq!(
        *misuse_outcome.lock().unwrap(),
        Some(scatter_gather::OutcomeKind::Panicked)
    );
    assert!(*sibling_ok.lock().unwrap());
}

/// A subscriber sees the expected event shape: per-task scatter/admission/
/// start/finish/gather events, plus the final `closing -> done` transition.
#[tokio::test]
async fn observability_stream_reports_lifecycle_events() {
    let pool = single_pool(1);
    let job = Job::new([pool.clone()]);
    let ctx = job.scope();
    let mut events = job.subscribe();

    job.scatter(
        &ctx,
        &pool,
        |_task_ctx| async { Ok::<(), StringError>(()) },
        |_gather_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
    )
    .await
    .unwrap();

    job.finish(&ctx).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(seen.iter().any(|e| matches!(e, JobEvent::TaskScattered { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::PoolAdmissionGranted { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::TaskStarted { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::TaskFinished { .. })));
    assert!(seen.iter().any(|e| matches!(e, JobEvent::GatherInvoked { error: None })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, JobEvent::StateChanged { state: JobState::Closing })));
    assert!(seen
        .iter()
        .any(|e| matches!(e, JobEvent::StateChanged { state: JobState::Done })));
}

/// `Cancel` is idempotent and `Finish` on a job with zero scatters
/// returns immediately. `Finish` then any further `Scatter` returns the
/// terminal error.
#[tokio::test]
async fn idempotence_and_zero_scatter_boundary() {
    let job = Job::new([single_pool(1)]);
    job.cancel();
    job.cancel();
    assert_eq!(job.state(), JobState::Closing);

    let pool = single_pool(1);
    let empty_job = Job::new([pool.clone()]);
    let ctx = empty_job.scope();
    empty_job.finish(&ctx).await.unwrap();
    assert_eq!(empty_job.state(), JobState::Done);

    let err = empty_job
        .scatter(
            &ctx,
            &pool,
            |_ctx| async { Ok::<(), StringError>(()) },
            |_ctx, _outcome: Outcome<(), StringError>| async { Ok::<(), StringError>(()) },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobDone));
}
