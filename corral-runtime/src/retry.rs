//! Backoff policies shared by the runtimes

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

pub(crate) const RESTART_INITIAL: Duration = Duration::from_millis(500);
pub(crate) const RESTART_MAX: Duration = Duration::from_secs(60);

/// Policy for restarting controllers and retrying bootstrap lists:
/// 500 ms initial, capped at one minute, never giving up.
pub(crate) fn restart_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(RESTART_INITIAL)
        .with_max_interval(RESTART_MAX)
        .with_max_elapsed_time(None)
        .build()
}

/// Per-item retry policy for queued runtimes; same shape as the restart
/// policy, tracked per `(pointer, job)`.
pub(crate) fn item_policy() -> ExponentialBackoff {
    restart_policy()
}

/// The next delay; the policy never gives up, the cap is a fallback.
pub(crate) fn next_interval(policy: &mut ExponentialBackoff) -> Duration {
    policy.next_backoff().unwrap_or(RESTART_MAX)
}
