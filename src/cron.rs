use chrono::{DateTime, Utc};
use croner::Cron;

use crate::errors::{Result, SchedulerError};

/// Validate a 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week with `*`, `,`, `-`, `/`, `?` and named tokens).
pub fn validate(expr: &str) -> Result<()> {
    Cron::new(expr)
        .parse()
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))?;
    Ok(())
}

/// Compute the next firing instant for a cron expression after `after`
/// (exclusive), in UTC.
///
/// The evaluator runs purely in UTC; callers holding local-time schedules
/// must pre-convert. An expression with no future match (croner gives up
/// after its search horizon) yields `UnsatisfiableSchedule`.
pub fn next_occurrence(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let cron = Cron::new(expr)
        .parse()
        .map_err(|e| SchedulerError::InvalidCron(format!("'{}': {}", expr, e)))?;
    cron.find_next_occurrence(&after, false)
        .map_err(|_| SchedulerError::UnsatisfiableSchedule)
}
