//! Five-field cron expressions.
//!
//! The external surface is the classic `minute hour day-of-month month
//! day-of-week` form. The `cron` crate wants a seconds field up front, so
//! the parser validates the field count and pins seconds to zero before
//! handing over.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;

use crate::error::{EngineError, EngineResult};

/// Parse a five-field cron expression.
///
/// Each field may be `*`, a number, a list, a range, or a step (`*/N`).
pub fn parse_cron_expression(expr: &str) -> EngineResult<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(EngineError::Validation(format!(
            "cron expression {expr:?} must have exactly five fields \
             (minute hour day-of-month month day-of-week)"
        )));
    }

    let widened = format!("0 {}", fields.join(" "));
    Schedule::from_str(&widened)
        .map_err(|err| EngineError::Validation(format!("invalid cron expression {expr:?}: {err}")))
}

/// The next fire time strictly after `after`, evaluated in the engine
/// timezone and reported back in UTC.
///
/// `None` means the schedule has no future fire (e.g. an impossible date).
pub fn next_fire_after(
    schedule: &Schedule,
    after: DateTime<Utc>,
    timezone: &FixedOffset,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(timezone))
        .next()
        .map(|fire| fire.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn accepts_wildcards_steps_lists_and_ranges() {
        assert!(parse_cron_expression("* * * * *").is_ok());
        assert!(parse_cron_expression("*/5 * * * *").is_ok());
        assert!(parse_cron_expression("0 18 * * *").is_ok());
        assert!(parse_cron_expression("0,30 9-17 * * 1-5").is_ok());
    }

    #[test]
    fn rejects_wrong_field_counts() {
        assert!(parse_cron_expression("").is_err());
        assert!(parse_cron_expression("* * * *").is_err());
        assert!(parse_cron_expression("0 * * * * *").is_err());
    }

    #[test]
    fn rejects_garbage_fields() {
        assert!(parse_cron_expression("every five minutes ok ?").is_err());
        assert!(parse_cron_expression("61 * * * *").is_err());
    }

    #[test]
    fn steady_state_fires_are_five_minutes_apart() {
        let schedule = parse_cron_expression("*/5 * * * *").unwrap();
        let tz = utc_offset();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let first = next_fire_after(&schedule, start, &tz).unwrap();
        let second = next_fire_after(&schedule, first, &tz).unwrap();
        let third = next_fire_after(&schedule, second, &tz).unwrap();

        assert_eq!((second - first).num_seconds(), 300);
        assert_eq!((third - second).num_seconds(), 300);
    }

    #[test]
    fn daily_fire_lands_on_the_scheduled_minute() {
        let schedule = parse_cron_expression("30 18 * * *").unwrap();
        let tz = utc_offset();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let fire = next_fire_after(&schedule, start, &tz).unwrap();
        assert_eq!(fire, Utc.with_ymd_and_hms(2025, 6, 1, 18, 30, 0).unwrap());
    }
}
