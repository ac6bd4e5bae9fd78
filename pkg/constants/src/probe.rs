//! Liveness probe policy defaults.

/// Seconds to wait after instance start before the first probe.
pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 5;

/// Seconds between probes once the initial delay has elapsed.
pub const DEFAULT_PERIOD_SECS: u64 = 10;

/// Consecutive probe successes required before an instance becomes Ready.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;

/// Consecutive probe failures before an instance is marked Failed.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
