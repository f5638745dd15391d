//! Due/not-due decisions for cron schedules.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::cron::{CronExpr, CronParseError};

/// Outcome of evaluating a schedule at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether an occurrence has passed since the baseline.
    pub due: bool,
    /// First occurrence strictly after the baseline.
    pub next_due: DateTime<Utc>,
}

impl Decision {
    /// Time until `next_due`, zero if it has already passed.
    pub fn requeue_after(&self, now: DateTime<Utc>) -> Duration {
        (self.next_due - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Decide whether `schedule` is due at `now`.
///
/// The baseline is `last_run` when present, otherwise `now`, so a freshly
/// created schedule never fires retroactively for occurrences it missed.
pub fn decide(
    schedule: &str,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Decision, CronParseError> {
    let expr = CronExpr::parse(schedule)?;
    let baseline = last_run.unwrap_or(now);
    let next_due = expr.next_occurrence(&baseline)?;

    Ok(Decision {
        due: next_due <= now,
        next_due,
    })
}
