//! Public error taxonomy for the scatter/gather runtime.
//!
//! Programmer-misuse conditions (a nil task function, a pool bound to the
//! wrong job, scattering from inside a task body) are signalled as panics
//! rather than through this enum — see the module docs on [`crate::Job`].

use std::fmt;

/// Boxed, type-erased error, used for the caller-supplied `gather` closure's
/// failure type so a single [`Job`](crate::Job) can host scatters of many
/// unrelated task/error types over its lifetime.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the public scatter/gather verbs.
///
/// Programmer misuse (nil task function, double-binding a pool, scattering
/// from a task body) panics instead of returning a value here — those are
/// bugs in the caller, not runtime conditions a caller is expected to handle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The job has finished closing (`Finish`/`CloseAndGatherAll` has
    /// returned); no further scatters are accepted.
    #[error("job is done; no further tasks may be scattered")]
    JobDone,

    /// The job is draining (`Finish`/`CloseAndGatherAll` is in progress);
    /// no further scatters are accepted.
    #[error("job is closing; no further tasks may be scattered")]
    JobClosing,

    /// The operation observed cancellation — of the job's root context, of
    /// the caller-supplied scope, or of a pool admission wait — before it
    /// could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// A scattered task panicked. Delivered to its gather closure as the
    /// task's outcome; never returned directly except when a gather
    /// closure itself propagates it.
    #[error("task panicked")]
    TaskPanicked,

    /// A gather closure returned an error. Carries the first such error
    /// observed by the job; subsequent gather errors are recorded but not
    /// retained (see [`crate::Job::finish`]).
    #[error("gather closure failed: {0}")]
    Gather(#[source] BoxError),
}

impl Error {
    pub(crate) fn gather(err: BoxError) -> Self {
        Error::Gather(err)
    }
}

/// A minimal `std::error::Error` wrapper used by unit tests and examples
/// that need a cheap, named error type without pulling in a crate.
#[derive(Debug)]
pub struct StringError(
    /// The error message.
    pub String,
);

impl fmt::Display for StringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StringError {}
