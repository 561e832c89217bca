#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! An in-process scatter/gather job runtime: admits asynchronous tasks
//! against per-pool concurrency limits and couples each to a gather
//! continuation that runs, one at a time, as tasks complete.
//!
//! A [`Job`] owns a set of [`Pool`]s and a single-consumer gather channel.
//! [`Job::scatter`] enqueues a task and its gather continuation; [`Pool`]
//! admits it against a concurrency cap; the task runs on its own spawned
//! task ([`task`]); its result is routed back as a boxed invocation of the
//! gather closure, consumed one at a time by [`Job::gather`]/
//! [`Job::gather_one`]/[`Job::finish`]. A gather closure may scatter further
//! tasks (that's the *dispatcher* in the module layout below) — scattering
//! from inside a task's own body is the one disallowed pattern, enforced by
//! tagging [`Scope`] with its role and checked at the top of
//! [`Job::scatter`].
//!
//! ```
//! use scatter_gather::{Job, Pool, PoolConfig, Outcome, StringError};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = Pool::new(PoolConfig::bounded("work", 4));
//! let job = Job::new([pool.clone()]);
//! let ctx = job.scope();
//!
//! job.scatter(
//!     &ctx,
//!     &pool,
//!     |_task_ctx| async { Ok::<i32, StringError>(21 * 2) },
//!     |_gather_ctx, outcome: Outcome<i32, StringError>| async move {
//!         if let Outcome::Value(v) = outcome {
//!             assert_eq!(v, 42);
//!         }
//!         Ok::<(), StringError>(())
//!     },
//! )
//! .await
//! .unwrap();
//!
//! job.finish(&ctx).await.unwrap();
//! # }
//! ```

mod backpressure;
mod config;
mod ctx;
mod envelope;
mod error;
mod events;
mod fifo;
mod heap;
mod job;
mod pool;
mod task;
mod timer_pool;
mod waiter;

pub use config::{JobConfig, PoolConfig, UNBOUNDED};
pub use ctx::{GatherContext, Scope, TaskContext};
pub use envelope::{Outcome, OutcomeKind, PanicMessage};
pub use error::{BoxError, Error, StringError};
pub use events::{JobEvent, JobState, PoolSnapshot, StatusSnapshot};
pub use job::Job;
pub use pool::Pool;
