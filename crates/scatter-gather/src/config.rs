//! Configuration surfaces for pools and jobs.
//!
//! Small `*Config` structs with `DEFAULT_*` associated constants, the same
//! shape as `EngineConfig` in the engine this crate is modeled on, rather
//! than a pile of constructor arguments.

/// Sentinel `limit` value meaning "no admission cap".
pub const UNBOUNDED: usize = usize::MAX;

/// Configuration for one [`crate::Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Label attached to this pool's `JobEvent`s, for diagnostics.
    pub label: String,
    /// Maximum number of concurrently running tasks. `UNBOUNDED` disables
    /// admission control entirely (in-flight is still tracked for
    /// observability).
    pub limit: usize,
}

impl PoolConfig {
    /// Default concurrency limit for [`PoolConfig::bounded`] callers that
    /// don't have a more specific number in mind.
    pub const DEFAULT_LIMIT: usize = 8;

    /// A pool admitting at most `limit` concurrent tasks.
    pub fn bounded(label: impl Into<String>, limit: usize) -> Self {
        assert!(limit > 0, "pool limit must be at least 1");
        Self {
            label: label.into(),
            limit,
        }
    }

    /// A pool with no admission cap.
    pub fn unbounded(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            limit: UNBOUNDED,
        }
    }

    pub(crate) fn is_unbounded(&self) -> bool {
        self.limit == UNBOUNDED
    }
}

/// Configuration for one [`crate::Job`].
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Capacity of the `JobEvent` broadcast channel. Slow subscribers drop
    /// events rather than stalling the job once this fills (`Lagged`).
    pub event_channel_capacity: usize,
    /// Bounded number of non-blocking pre-drain attempts `scatter` makes
    /// before it admits against a pool (§4.5, backpressure coordinator).
    pub backpressure_yields: usize,
}

impl JobConfig {
    /// Default broadcast channel capacity.
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

    /// Default bounded pre-drain count ahead of an admission wait.
    pub const DEFAULT_BACKPRESSURE_YIELDS: usize = 2;
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: Self::DEFAULT_EVENT_CHANNEL_CAPACITY,
            backpressure_yields: Self::DEFAULT_BACKPRESSURE_YIELDS,
        }
    }
}
