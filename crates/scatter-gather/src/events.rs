//! Ambient observability: a broadcast stream of [`JobEvent`]s and a
//! `watch`-backed [`StatusSnapshot`], in the shape of this repository's
//! `EngineEvent`/`StatusSnapshot` pair rather than a `tracing`/`log`
//! dependency the teacher crate never reached for (§1.1).
//!
//! Neither of these crosses a process boundary here, so unlike their
//! `client-engine` counterparts they carry no `serde` impls.

use crate::envelope::OutcomeKind;

/// Coarse lifecycle state of a [`crate::Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepting scatters.
    Open,
    /// Draining outstanding tasks; no further scatters are accepted.
    Closing,
    /// Every scattered task has been gathered (or abandoned under cancellation).
    Done,
}

/// A state transition or notable event on a [`crate::Job`], emitted on its
/// broadcast channel (`Job::subscribe`). Purely observational: nothing in
/// this crate blocks on a subscriber, and a lagging subscriber drops events
/// rather than stalling the job (`tokio::sync::broadcast`'s `Lagged`).
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A scatter call registered a new outstanding task and is about to
    /// request admission from `pool`.
    TaskScattered {
        /// The pool the task will be admitted through.
        pool: String,
    },
    /// A scatter call is queued behind `pool`'s concurrency limit.
    PoolAdmissionQueued {
        /// The pool the caller is queued on.
        pool: String,
    },
    /// `pool` granted a waiting (or immediate) admission.
    PoolAdmissionGranted {
        /// The pool that admitted the task.
        pool: String,
    },
    /// A scatter call was rejected before a task ever ran (terminal job
    /// state, or cancellation while queued for admission).
    ScatterRejected {
        /// A human-readable reason, from the rejecting [`crate::Error`]'s
        /// `Display` impl.
        reason: String,
    },
    /// A task's body began executing on its own spawned task.
    TaskStarted {
        /// The pool the task was admitted through.
        pool: String,
    },
    /// A task's body finished, in any of the four [`OutcomeKind`]s. Emitted
    /// after the pool slot has already been released (§4.4's ordering
    /// guarantee), before the completion envelope is routed to a gather
    /// closure.
    TaskFinished {
        /// The pool the task was admitted through.
        pool: String,
        /// What happened to the task.
        outcome: OutcomeKind,
    },
    /// A gather closure ran to completion. `error` carries its `Display`
    /// rendering if it returned one.
    GatherInvoked {
        /// The gather closure's error, stringified, if it returned one.
        error: Option<String>,
    },
    /// The job transitioned to a new lifecycle state.
    StateChanged {
        /// The state just entered.
        state: JobState,
    },
}

/// A point-in-time view of one [`crate::Pool`]'s admission state, as
/// reported in a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// The pool's label.
    pub label: String,
    /// The pool's concurrency limit, or `None` if unbounded.
    pub limit: Option<usize>,
    /// Tasks currently admitted and running.
    pub in_flight: usize,
    /// Callers currently queued for admission.
    pub queued: usize,
}

/// A point-in-time view of a [`crate::Job`]'s live counters, refreshed on
/// every state-changing operation and exposed via a
/// `tokio::sync::watch::Receiver` from `Job::snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// The job's current lifecycle state.
    pub state: JobState,
    /// Tasks scattered but not yet gathered.
    pub outstanding: i64,
    /// One entry per pool bound to the job, in bind order.
    pub pools: Vec<PoolSnapshot>,
}
