use chrono::{Datelike, Days, Months, NaiveDateTime, Weekday};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use tracing::warn;

use super::local_time::{LocalTime, LocalTimeError};

pub(crate) const FALLBACK_INTERVAL_DAYS: u32 = 2;
const MAX_CATCH_UP_STEPS: usize = 100_000;

static EVERY_N_DAYS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^every[-_ ](\d+)[-_ ]days?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecurrencePattern {
    Once,
    Daily,
    Weekly,
    Monthly,
    Interval { days: u32 },
}

impl RecurrencePattern {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrencePattern::Once)
    }
}

impl fmt::Display for RecurrencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecurrencePattern::Once => f.write_str("once"),
            RecurrencePattern::Daily => f.write_str("daily"),
            RecurrencePattern::Weekly => f.write_str("weekly"),
            RecurrencePattern::Monthly => f.write_str("monthly"),
            RecurrencePattern::Interval { days } => write!(f, "every-{}-days", days),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecurrenceError {
    #[error("local time error: {0}")]
    LocalTime(#[from] LocalTimeError),
    #[error("recurrence '{0}' has no next occurrence")]
    NotRecurring(RecurrencePattern),
    #[error("advancing {from} by {pattern} is out of range")]
    OutOfRange {
        from: NaiveDateTime,
        pattern: RecurrencePattern,
    },
    #[error("no future occurrence of {pattern} reachable from {from}")]
    NoFutureOccurrence {
        from: NaiveDateTime,
        pattern: RecurrencePattern,
    },
}

/// Parses a recurrence expression. Blank input means `once`; anything else
/// that is not recognised becomes a two-day interval (logged).
pub fn parse_recurrence(expr: &str) -> RecurrencePattern {
    let normalized = expr.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "" | "once" => return RecurrencePattern::Once,
        "daily" => return RecurrencePattern::Daily,
        "weekly" => return RecurrencePattern::Weekly,
        "monthly" => return RecurrencePattern::Monthly,
        _ => {}
    }
    if let Some(captures) = EVERY_N_DAYS_PATTERN.captures(&normalized) {
        match captures[1].parse::<u32>() {
            Ok(days) if days > 0 => return RecurrencePattern::Interval { days },
            _ => warn!(
                "invalid interval in recurrence '{}'; using every-{}-days",
                expr, FALLBACK_INTERVAL_DAYS
            ),
        }
    } else {
        warn!(
            "unrecognized recurrence '{}'; using every-{}-days",
            expr, FALLBACK_INTERVAL_DAYS
        );
    }
    RecurrencePattern::Interval {
        days: FALLBACK_INTERVAL_DAYS,
    }
}

/// Moves local calendar fields forward by one period. Monthly steps clamp the
/// day of month to the end of shorter months (Jan 31 -> Feb 28/29).
pub fn advance(
    fields: NaiveDateTime,
    pattern: RecurrencePattern,
) -> Result<NaiveDateTime, RecurrenceError> {
    let next = match pattern {
        RecurrencePattern::Once => return Err(RecurrenceError::NotRecurring(pattern)),
        RecurrencePattern::Daily => fields.checked_add_days(Days::new(1)),
        RecurrencePattern::Weekly => fields.checked_add_days(Days::new(7)),
        RecurrencePattern::Monthly => fields.checked_add_months(Months::new(1)),
        RecurrencePattern::Interval { days } => fields.checked_add_days(Days::new(days as u64)),
    };
    next.ok_or(RecurrenceError::OutOfRange {
        from: fields,
        pattern,
    })
}

/// Keeps `fields` when it already falls on an allowed weekday, otherwise moves
/// forward to the first allowed one. An empty set allows every day.
pub fn constrain_to_allowed_weekdays(fields: NaiveDateTime, allowed: &[Weekday]) -> NaiveDateTime {
    if allowed.is_empty() || allowed.contains(&fields.weekday()) {
        return fields;
    }
    for offset in 1..=7u64 {
        if let Some(candidate) = fields.checked_add_days(Days::new(offset)) {
            if allowed.contains(&candidate.weekday()) {
                return candidate;
            }
        }
    }
    // Only reachable near the end of the representable calendar: fall back to
    // the earliest allowed weekday of the following week.
    let earliest = allowed
        .iter()
        .map(|day| day.num_days_from_monday())
        .min()
        .unwrap_or(0);
    let to_next_monday = 7 - fields.weekday().num_days_from_monday();
    fields
        .checked_add_days(Days::new((to_next_monday + earliest) as u64))
        .unwrap_or(fields)
}

/// One step of `pattern` followed by the weekday constraint.
pub fn next_occurrence(
    time: &LocalTime,
    pattern: RecurrencePattern,
    allowed: &[Weekday],
) -> Result<LocalTime, RecurrenceError> {
    Ok(step(time, pattern, allowed)?.0)
}

fn step(
    time: &LocalTime,
    pattern: RecurrencePattern,
    allowed: &[Weekday],
) -> Result<(LocalTime, bool), RecurrenceError> {
    let advanced = advance(time.fields, pattern)?;
    let constrained = constrain_to_allowed_weekdays(advanced, allowed);
    Ok((time.with_fields(constrained), constrained != advanced))
}

/// Result of catching a recurrence up to the present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextOccurrence {
    pub time: LocalTime,
    /// Missed occurrences stepped over before reaching `time`.
    pub skipped: usize,
    /// The weekday constraint moved the returned occurrence.
    pub weekday_adjusted: bool,
}

/// Steps forward until `is_future` accepts the occurrence. Missed occurrences
/// are skipped, never returned.
pub fn next_future_occurrence<F>(
    time: &LocalTime,
    pattern: RecurrencePattern,
    allowed: &[Weekday],
    is_future: F,
) -> Result<NextOccurrence, RecurrenceError>
where
    F: Fn(&LocalTime) -> bool,
{
    let (mut current, mut adjusted) = step(time, pattern, allowed)?;
    for skipped in 0..MAX_CATCH_UP_STEPS {
        if is_future(&current) {
            return Ok(NextOccurrence {
                time: current,
                skipped,
                weekday_adjusted: adjusted,
            });
        }
        (current, adjusted) = step(&current, pattern, allowed)?;
    }
    Err(RecurrenceError::NoFutureOccurrence {
        from: time.fields,
        pattern,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reminder::local_time::decode;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    #[test]
    fn parse_recognizes_known_patterns() {
        assert_eq!(parse_recurrence("once"), RecurrencePattern::Once);
        assert_eq!(parse_recurrence(" Daily "), RecurrencePattern::Daily);
        assert_eq!(parse_recurrence("WEEKLY"), RecurrencePattern::Weekly);
        assert_eq!(parse_recurrence("monthly"), RecurrencePattern::Monthly);
        assert_eq!(
            parse_recurrence("every-3-days"),
            RecurrencePattern::Interval { days: 3 }
        );
        assert_eq!(
            parse_recurrence("every-1-day"),
            RecurrencePattern::Interval { days: 1 }
        );
        assert_eq!(parse_recurrence(""), RecurrencePattern::Once);
    }

    #[test]
    fn parse_falls_back_to_two_day_interval() {
        assert_eq!(
            parse_recurrence("fortnightly-ish"),
            RecurrencePattern::Interval { days: 2 }
        );
        assert_eq!(
            parse_recurrence("every-0-days"),
            RecurrencePattern::Interval { days: 2 }
        );
    }

    #[test]
    fn advance_moves_by_one_period() {
        let start = at(2025, 9, 5, 9, 0);
        assert_eq!(
            advance(start, RecurrencePattern::Daily).unwrap(),
            at(2025, 9, 6, 9, 0)
        );
        assert_eq!(
            advance(start, RecurrencePattern::Weekly).unwrap(),
            at(2025, 9, 12, 9, 0)
        );
        assert_eq!(
            advance(start, RecurrencePattern::Monthly).unwrap(),
            at(2025, 10, 5, 9, 0)
        );
        assert_eq!(
            advance(start, RecurrencePattern::Interval { days: 10 }).unwrap(),
            at(2025, 9, 15, 9, 0)
        );
        assert!(matches!(
            advance(start, RecurrencePattern::Once),
            Err(RecurrenceError::NotRecurring(_))
        ));
    }

    #[test]
    fn monthly_clamps_to_end_of_shorter_month() {
        assert_eq!(
            advance(at(2025, 8, 31, 8, 0), RecurrencePattern::Monthly).unwrap(),
            at(2025, 9, 30, 8, 0)
        );
        assert_eq!(
            advance(at(2024, 1, 31, 8, 0), RecurrencePattern::Monthly).unwrap(),
            at(2024, 2, 29, 8, 0)
        );
    }

    #[test]
    fn advance_is_strictly_later_and_composes() {
        let patterns = [
            RecurrencePattern::Daily,
            RecurrencePattern::Weekly,
            RecurrencePattern::Monthly,
            RecurrencePattern::Interval { days: 4 },
        ];
        let starts = [at(2025, 1, 31, 0, 0), at(2025, 3, 9, 2, 30), at(2024, 12, 31, 23, 59)];
        for pattern in patterns {
            for start in starts {
                assert!(advance(start, pattern).unwrap() > start);
            }
        }

        let start = at(2025, 9, 5, 9, 0);
        let twice = advance(
            advance(start, RecurrencePattern::Weekly).unwrap(),
            RecurrencePattern::Weekly,
        )
        .unwrap();
        assert_eq!(
            twice,
            advance(start, RecurrencePattern::Interval { days: 14 }).unwrap()
        );
    }

    #[test]
    fn weekday_constraint_moves_saturday_to_monday() {
        let saturday = at(2025, 9, 6, 9, 0);
        assert_eq!(saturday.weekday(), Weekday::Sat);
        let constrained =
            constrain_to_allowed_weekdays(saturday, &[Weekday::Mon, Weekday::Wed]);
        assert_eq!(constrained, at(2025, 9, 8, 9, 0));
    }

    #[test]
    fn weekday_constraint_keeps_allowed_days_and_empty_sets() {
        let wednesday = at(2025, 9, 10, 7, 15);
        assert_eq!(
            constrain_to_allowed_weekdays(wednesday, &[Weekday::Mon, Weekday::Wed]),
            wednesday
        );
        assert_eq!(constrain_to_allowed_weekdays(wednesday, &[]), wednesday);
    }

    #[test]
    fn next_future_occurrence_skips_missed_occurrences() {
        let start = decode("2025-09-01T09:00:00-07:00").unwrap();
        let cutoff = at(2025, 9, 20, 0, 0);
        let next = next_future_occurrence(&start, RecurrencePattern::Weekly, &[], |candidate| {
            candidate.fields > cutoff
        })
        .unwrap();
        assert_eq!(next.time.encode(), "2025-09-22T09:00:00-07:00");
        assert_eq!(next.skipped, 2);
        assert!(!next.weekday_adjusted);
    }

    #[test]
    fn next_future_occurrence_reports_weekday_adjustment() {
        // Friday weekly, constrained to Mon/Wed.
        let start = decode("2025-09-05T09:00:00-07:00").unwrap();
        let next = next_future_occurrence(
            &start,
            RecurrencePattern::Weekly,
            &[Weekday::Mon, Weekday::Wed],
            |_| true,
        )
        .unwrap();
        assert_eq!(next.time.encode(), "2025-09-15T09:00:00-07:00");
        assert!(next.weekday_adjusted);
    }
}
