//! Cron expression parsing and evaluation.
//!
//! Supports six-field cron expressions with seconds granularity:
//! ```text
//! ┌───────────── second (0-59)
//! │ ┌───────────── minute (0-59)
//! │ │ ┌───────────── hour (0-23)
//! │ │ │ ┌───────────── day of month (1-31)
//! │ │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ │ ┌───────────── day of week (0-6, 0 = Sunday)
//! │ │ │ │ │ │
//! * * * * * *
//! ```
//!
//! Every field accepts `*`, single values, ranges (`a-b`), steps (`*/n`,
//! `a-b/n`) and comma separated lists. All evaluation happens in UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Number of fields in an expression.
pub const FIELD_COUNT: usize = 6;

/// How far ahead `next_after` searches before giving up. Covers Feb 29.
const SEARCH_HORIZON_YEARS: i32 = 5;

/// The specific syntax fault found in an expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronFault {
    #[error("expression is empty")]
    Empty,
    #[error("expected 6 fields (second minute hour day-of-month month day-of-week), found {0}")]
    FieldCount(usize),
    #[error("invalid {field} field '{token}': {reason}")]
    InvalidField {
        field: &'static str,
        token: String,
        reason: &'static str,
    },
    #[error("value {value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid {field} range: {start}-{end}")]
    InvalidRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
    #[error("invalid {field} step '{step}'")]
    InvalidStep { field: &'static str, step: String },
    #[error("no occurrence within {0} years")]
    NoOccurrence(i32),
}

/// Error returned when an expression cannot be parsed or never fires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error in cron expression \"{expression}\": {fault}")]
pub struct CronParseError {
    /// The offending expression, verbatim.
    pub expression: String,
    /// What is wrong with it.
    pub fault: CronFault,
}

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    name: &'static str,
    /// The set of valid values for this field.
    pub values: BTreeSet<u32>,
    /// Minimum allowed value.
    pub min: u32,
    /// Maximum allowed value.
    pub max: u32,
    /// Written as a bare `*`. Only such fields count as unrestricted for the
    /// day-of-month / day-of-week rule; `1-31` is a restriction.
    star: bool,
}

impl CronField {
    fn new(name: &'static str, min: u32, max: u32) -> Self {
        Self {
            name,
            values: BTreeSet::new(),
            min,
            max,
            star: false,
        }
    }

    fn parse(&mut self, expr: &str) -> Result<(), CronFault> {
        for part in expr.split(',') {
            self.parse_part(part.trim())?;
        }
        Ok(())
    }

    fn parse_part(&mut self, part: &str) -> Result<(), CronFault> {
        if part.is_empty() {
            return Err(self.invalid(part, "empty list element"));
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str.parse::<u32>().map_err(|_| CronFault::InvalidStep {
                    field: self.name,
                    step: step_str.to_string(),
                })?;
                if step == 0 {
                    return Err(CronFault::InvalidStep {
                        field: self.name,
                        step: step_str.to_string(),
                    });
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            if step.unwrap_or(1) == 1 {
                self.star = true;
            }
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = lo
                .parse::<u32>()
                .map_err(|_| self.invalid(range_part, "invalid start of range"))?;
            let end = hi
                .parse::<u32>()
                .map_err(|_| self.invalid(range_part, "invalid end of range"))?;
            if start > end {
                return Err(CronFault::InvalidRange {
                    field: self.name,
                    start,
                    end,
                });
            }
            (start, end)
        } else {
            let value = range_part
                .parse::<u32>()
                .map_err(|_| self.invalid(range_part, "invalid value"))?;
            // `5/15` means "from 5 to the end of the range, every 15"
            match step {
                Some(_) => (value, self.max),
                None => (value, value),
            }
        };

        if start < self.min || end > self.max {
            return Err(CronFault::OutOfRange {
                field: self.name,
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1) as usize;
        self.values.extend((start..=end).step_by(step));
        Ok(())
    }

    fn invalid(&self, token: &str, reason: &'static str) -> CronFault {
        CronFault::InvalidField {
            field: self.name,
            token: token.to_string(),
            reason,
        }
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// True when the field was written as `*`.
    pub fn is_wildcard(&self) -> bool {
        self.star
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    /// Original expression string.
    pub expr: String,
    pub second: CronField,
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    /// Day of week field (0-6, 0 = Sunday).
    pub day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        Self::parse_fields(expr).map_err(|fault| CronParseError {
            expression: expr.to_string(),
            fault,
        })
    }

    fn parse_fields(expr: &str) -> Result<Self, CronFault> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.is_empty() {
            return Err(CronFault::Empty);
        }
        if parts.len() != FIELD_COUNT {
            return Err(CronFault::FieldCount(parts.len()));
        }

        let mut second = CronField::new("second", 0, 59);
        let mut minute = CronField::new("minute", 0, 59);
        let mut hour = CronField::new("hour", 0, 23);
        let mut day_of_month = CronField::new("day-of-month", 1, 31);
        let mut month = CronField::new("month", 1, 12);
        let mut day_of_week = CronField::new("day-of-week", 0, 6);

        second.parse(parts[0])?;
        minute.parse(parts[1])?;
        hour.parse(parts[2])?;
        day_of_month.parse(parts[3])?;
        month.parse(parts[4])?;
        day_of_week.parse(parts[5])?;

        Ok(Self {
            expr: expr.to_string(),
            second,
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    /// Day matching follows cron convention: when both day fields are
    /// restricted, either one matching is enough.
    fn matches_day(&self, dt: &DateTime<Utc>) -> bool {
        let dom = self.day_of_month.matches(dt.day());
        let dow = self
            .day_of_week
            .matches(dt.weekday().num_days_from_sunday());
        match (self.day_of_month.is_wildcard(), self.day_of_week.is_wildcard()) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First occurrence strictly after `after`, or `None` when the expression
    /// has no occurrence within the search horizon (e.g. February 30th).
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = after.with_nanosecond(0)? + Duration::seconds(1);
        let limit = current.year() + SEARCH_HORIZON_YEARS;

        while current.year() <= limit {
            if !self.month.matches(current.month()) {
                let (year, month) = if current.month() == 12 {
                    (current.year() + 1, 1)
                } else {
                    (current.year(), current.month() + 1)
                };
                current = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
                continue;
            }
            if !self.matches_day(&current) {
                current = (current.date_naive() + Duration::days(1))
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !self.hour.matches(current.hour()) {
                current = current.with_minute(0)?.with_second(0)? + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(current.minute()) {
                current = current.with_second(0)? + Duration::minutes(1);
                continue;
            }
            if !self.second.matches(current.second()) {
                current += Duration::seconds(1);
                continue;
            }
            return Some(current);
        }

        None
    }

    /// Like [`next_after`](Self::next_after) but reports a missing occurrence
    /// as a parse error against this expression.
    pub fn next_occurrence(&self, after: &DateTime<Utc>) -> Result<DateTime<Utc>, CronParseError> {
        self.next_after(after).ok_or_else(|| CronParseError {
            expression: self.expr.clone(),
            fault: CronFault::NoOccurrence(SEARCH_HORIZON_YEARS),
        })
    }
}
