//! Durable form of a committed item, shared by every store.

use chrono::{DateTime, Utc};

use taskline_core::{CommitBatch, WorkItem, WorkStatus};

/// Row to persist for `item` after `batch` is committed.
///
/// Ready items move to the batch's next step, Processed items stay where
/// they are as terminal successes, Error items stay on their step with one
/// more attempt. An item still marked Processing was never settled by the
/// handler and goes back to Ready on its step.
pub(crate) fn settle(batch: &CommitBatch, item: &WorkItem, now: DateTime<Utc>) -> WorkItem {
    let mut row = item.clone();
    row.step = batch.step.name.clone();
    row.updated_at = now;
    match item.status {
        WorkStatus::Ready => {
            if let Some(next) = batch.destination_of(item) {
                row.step = next.name.clone();
            }
            row.error = None;
        }
        WorkStatus::Processed => row.error = None,
        WorkStatus::Error => row.attempts = item.attempts.saturating_add(1),
        WorkStatus::Processing => row.status = WorkStatus::Ready,
    }
    row
}
