//! Control-loop tick intervals, retry, and rollout/autoscale defaults.

// ─── Tick intervals ───────────────────────────────────────────────────────

/// How often the ReplicaSet reconciler runs a full pass.
pub const RECONCILE_INTERVAL_SECS: u64 = 5;

/// How often the rollout controller evaluates in-progress rollouts.
pub const ROLLOUT_INTERVAL_SECS: u64 = 5;

/// How often the autoscale controller re-evaluates utilization.
pub const AUTOSCALE_INTERVAL_SECS: u64 = 30;

// ─── Retry / backoff ──────────────────────────────────────────────────────

/// First retry delay after a failed instance creation, in milliseconds.
pub const CREATE_BACKOFF_BASE_MS: u64 = 500;

/// Ceiling for the exponential creation backoff, in milliseconds.
pub const CREATE_BACKOFF_MAX_MS: u64 = 30_000;

/// How many compare-and-swap attempts a writer makes before giving up
/// for this tick. The next tick retries from a fresh read anyway.
pub const CAS_MAX_ATTEMPTS: u32 = 5;

// ─── Rollout defaults ─────────────────────────────────────────────────────

/// Extra instances tolerated above desired during a rollout,
/// as a fraction of desired (rounded up).
pub const DEFAULT_MAX_SURGE_RATIO: f64 = 0.25;

/// Missing instances tolerated below desired during a rollout,
/// as a fraction of desired (rounded down).
pub const DEFAULT_MAX_UNAVAILABLE_RATIO: f64 = 0.25;

/// A rollout with no forward progress for this long is marked Failed.
pub const DEFAULT_PROGRESS_DEADLINE_SECS: u64 = 600;

// ─── Autoscale defaults ───────────────────────────────────────────────────

/// Minimum wall-clock gap between two replica-count changes made by the
/// autoscaler, to stop flapping on noisy metrics.
pub const DEFAULT_SCALE_COOLDOWN_SECS: u64 = 60;
