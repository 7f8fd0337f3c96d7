//! Retry selector: when to sweep failed items back in, and how far back.

use chrono::{DateTime, Utc};
use std::time::Duration;

use taskline_core::RetryPolicy;

/// Bounds of one retry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryWindow {
    /// Only items last touched before this instant are eligible.
    pub since: DateTime<Utc>,
    pub max_attempts: u32,
}

/// True on every `every_time`-th run. No policy means no retries.
pub fn should_retry(run_counter: u32, policy: Option<&RetryPolicy>) -> bool {
    match policy {
        Some(p) if p.every_time > 0 => run_counter % p.every_time == 0,
        _ => false,
    }
}

/// Look back `work_time * every_time` from `now`, so items still moving
/// through a normal cycle are not picked up.
pub fn retry_window(policy: &RetryPolicy, work_time: Duration, now: DateTime<Utc>) -> RetryWindow {
    let horizon = work_time.saturating_mul(policy.every_time);
    let since = chrono::Duration::from_std(horizon)
        .ok()
        .and_then(|h| now.checked_sub_signed(h))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    RetryWindow {
        since,
        max_attempts: policy.max_attempts,
    }
}
