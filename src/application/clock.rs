use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use cron::Schedule;

use crate::domain::error::DomainError;

/// All cron math flows through one of these; the zone is configuration,
/// not a hidden global.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    zone: FixedOffset,
}

/// UTC+8, the zone the system historically ran in.
pub const DEFAULT_ZONE_OFFSET_SECS: i32 = 8 * 3600;

impl Default for Clock {
    fn default() -> Self {
        match FixedOffset::east_opt(DEFAULT_ZONE_OFFSET_SECS) {
            Some(zone) => Self { zone },
            None => Self { zone: Utc.fix() },
        }
    }
}

impl Clock {
    #[must_use]
    pub fn with_offset_secs(secs: i32) -> Option<Self> {
        FixedOffset::east_opt(secs).map(|zone| Self { zone })
    }

    #[must_use]
    pub fn zone(&self) -> FixedOffset {
        self.zone
    }

    #[must_use]
    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.zone)
    }

    /// `YYYY-MM-DD` in the configured zone, the key for daily stats.
    #[must_use]
    pub fn today(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }

    /// Strictly-future next fire time of `expr` after `after`.
    pub fn next_fire(
        &self,
        expr: &str,
        after: DateTime<FixedOffset>,
    ) -> Result<DateTime<FixedOffset>, DomainError> {
        let schedule = parse_schedule(expr)?;
        schedule
            .after(&after.with_timezone(&self.zone))
            .next()
            .ok_or_else(|| {
                DomainError::InvalidSchedule(format!("no future occurrence for: {expr}"))
            })
    }
}

/// Parses a 6-field (seconds-first) cron expression. Classic 5-field
/// crontab syntax is accepted by prepending a zero seconds field; the
/// 7-field year form passes through.
pub fn parse_schedule(expr: &str) -> Result<Schedule, DomainError> {
    let expr = expr.trim();
    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        6 | 7 => expr.to_owned(),
        count => {
            return Err(DomainError::InvalidSchedule(format!(
                "expected 5, 6, or 7 fields, got {count}: {expr}"
            )));
        }
    };

    Schedule::from_str(&normalized)
        .map_err(|error| DomainError::InvalidSchedule(format!("{expr}: {error}")))
}

/// Cheap validity check for task admission.
pub fn validate_schedule(expr: &str) -> Result<(), DomainError> {
    parse_schedule(expr).map(|_| ())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::{Clock, DEFAULT_ZONE_OFFSET_SECS, validate_schedule};

    fn clock() -> Clock {
        Clock::with_offset_secs(DEFAULT_ZONE_OFFSET_SECS).expect("valid offset")
    }

    #[test]
    fn next_fire_honors_seconds_field() {
        let clock = clock();
        let after = clock
            .zone()
            .with_ymd_and_hms(2025, 1, 1, 0, 0, 3)
            .unwrap();
        let next = clock.next_fire("*/10 * * * * *", after).expect("next fire");
        assert_eq!(
            next,
            clock.zone().with_ymd_and_hms(2025, 1, 1, 0, 0, 10).unwrap()
        );
    }

    #[test]
    fn next_fire_is_strictly_future() {
        let clock = clock();
        let after = clock
            .zone()
            .with_ymd_and_hms(2025, 6, 15, 12, 0, 0)
            .unwrap();
        for expr in ["* * * * * *", "0 * * * * *", "0 0 3 * * *", "*/5 * * * *"] {
            let next = clock.next_fire(expr, after).expect("next fire");
            assert!(next > after, "{expr} produced a non-future fire time");
        }
    }

    #[test]
    fn five_field_expressions_are_normalized() {
        let clock = clock();
        let after = clock
            .zone()
            .with_ymd_and_hms(2025, 1, 1, 10, 30, 20)
            .unwrap();
        let next = clock.next_fire("*/15 * * * *", after).expect("next fire");
        assert_eq!(
            next,
            clock.zone().with_ymd_and_hms(2025, 1, 1, 10, 45, 0).unwrap()
        );
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        assert!(validate_schedule("not a cron").is_err());
        assert!(validate_schedule("* * *").is_err());
        assert!(validate_schedule("99 * * * * *").is_err());
        assert!(validate_schedule("0 0 12 * * *").is_ok());
    }
}
