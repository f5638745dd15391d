//! Scheduling module.
//!
//! Turns a cron schedule and the time a schedule last fired into a
//! due/not-due decision plus the next time it should be evaluated.

mod cron;
mod decision;

pub use cron::{CronExpr, CronFault, CronField, CronParseError};
pub use decision::{decide, Decision};
