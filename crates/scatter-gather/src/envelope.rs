//! The discriminated outcome of one scattered task.
//!
//! The Go-flavoured source this crate's behavior is modeled on threads a
//! `(value, err)` pair through even the panic/cancel cases, since a Go zero
//! value always exists. Rust has no such zero value for an arbitrary `V`,
//! so here the non-`Value` cases carry no `V`: a panic or cancellation
//! simply never produced one. The task/completion envelope described in
//! the data model is realized directly as the boxed gather invocation
//! carried on `Job`'s gather channel (see `job.rs`); `Outcome` is the part
//! of it a gather closure actually inspects.

use std::fmt;

use crate::error::Error;

/// What happened to one scattered task, delivered to its gather closure.
#[derive(Debug)]
pub enum Outcome<V, E> {
    /// The task function returned `Ok(value)`.
    Value(V),
    /// The task function returned `Err(err)`.
    Failed(E),
    /// The task function panicked. Carries a best-effort message extracted
    /// from the panic payload.
    Panicked(PanicMessage),
    /// The task was never run, or was aborted mid-flight, because its
    /// context (or the owning job's) was cancelled first.
    Cancelled,
}

impl<V, E> Outcome<V, E> {
    /// Returns `true` if the task completed without panicking or being
    /// cancelled, regardless of whether it returned `Ok` or `Err`.
    pub fn ran_to_completion(&self) -> bool {
        matches!(self, Outcome::Value(_) | Outcome::Failed(_))
    }

    /// The discriminant alone, for observability events that don't need
    /// (and shouldn't have to be generic over) the value/error payload.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Value(_) => OutcomeKind::Value,
            Outcome::Failed(_) => OutcomeKind::Failed,
            Outcome::Panicked(_) => OutcomeKind::Panicked,
            Outcome::Cancelled => OutcomeKind::Cancelled,
        }
    }

    /// The crate-level [`Error`] sentinel for the two outcomes that don't
    /// carry a user-defined error type: [`Error::TaskPanicked`] for
    /// [`Outcome::Panicked`], [`Error::Cancelled`] for [`Outcome::Cancelled`].
    /// `None` for [`Outcome::Value`]/[`Outcome::Failed`] — a gather closure
    /// that wants to fold a task's own `E` into its own return type handles
    /// those two cases itself.
    pub fn sentinel_error(&self) -> Option<Error> {
        match self {
            Outcome::Value(_) | Outcome::Failed(_) => None,
            Outcome::Panicked(_) => Some(Error::TaskPanicked),
            Outcome::Cancelled => Some(Error::Cancelled),
        }
    }
}

/// [`Outcome`] without its payload; what `JobEvent::TaskFinished` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The task function returned `Ok`.
    Value,
    /// The task function returned `Err`.
    Failed,
    /// The task function panicked.
    Panicked,
    /// The task was never run, or was aborted, due to cancellation.
    Cancelled,
}

/// A best-effort rendering of a task panic's payload.
///
/// `std::panic::catch_unwind`-style payloads are `Box<dyn Any + Send>`;
/// this crate never calls `catch_unwind` directly (task bodies run inside
/// their own spawned task, and `JoinError::is_panic` plus
/// `JoinError::into_panic` already hand back the payload), but the payload
/// itself is still an opaque `Any`, so it is rendered to a string once and
/// carried from then on.
#[derive(Debug, Clone)]
pub struct PanicMessage(
    /// The rendered panic payload.
    pub String,
);

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PanicMessage {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked with a non-string payload".to_string()
        };
        PanicMessage(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ran_to_completion_is_true_for_value_and_failed() {
        let ok: Outcome<i32, &str> = Outcome::Value(1);
        let err: Outcome<i32, &str> = Outcome::Failed("boom");
        assert!(ok.ran_to_completion());
        assert!(err.ran_to_completion());
    }

    #[test]
    fn ran_to_completion_is_false_for_panic_and_cancel() {
        let panicked: Outcome<i32, &str> = Outcome::Panicked(PanicMessage("oops".into()));
        let cancelled: Outcome<i32, &str> = Outcome::Cancelled;
        assert!(!panicked.ran_to_completion());
        assert!(!cancelled.ran_to_completion());
    }

    #[test]
    fn sentinel_error_covers_panic_and_cancel_only() {
        let value: Outcome<i32, &str> = Outcome::Value(1);
        let failed: Outcome<i32, &str> = Outcome::Failed("boom");
        let panicked: Outcome<i32, &str> = Outcome::Panicked(PanicMessage("oops".into()));
        let cancelled: Outcome<i32, &str> = Outcome::Cancelled;

        assert!(value.sentinel_error().is_none());
        assert!(failed.sentinel_error().is_none());
        assert!(matches!(panicked.sentinel_error(), Some(Error::TaskPanicked)));
        assert!(matches!(cancelled.sentinel_error(), Some(Error::Cancelled)));
    }
}
