//! Local-time codec.
//!
//! Reminder times travel as ISO-8601 strings with an explicit UTC offset
//! (`2025-09-05T09:00:00-07:00`). Recurrence arithmetic happens on the local
//! calendar fields, and the offset string is carried through verbatim. Going
//! through a UTC instant would shift the wall-clock time whenever the offset
//! at the next occurrence differs from the authored one.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;

static LOCAL_TIME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{4})-(\d{2})-(\d{2})T(\d{2}):(\d{2})(?::(\d{2})(?:\.\d{1,9})?)?(Z|[+-]\d{2}:\d{2})?$",
    )
    .unwrap()
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LocalTimeError {
    #[error("missing timezone offset in '{0}'")]
    MissingTimezone(String),
    #[error("invalid local time format '{0}'")]
    InvalidFormat(String),
    #[error("invalid calendar date or time in '{0}'")]
    InvalidDateTime(String),
    #[error("invalid utc offset '{0}'")]
    InvalidOffset(String),
}

/// A UTC offset exactly as it was written (`-07:00`, `+05:30`, `Z`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtcOffset {
    raw: String,
    seconds: i32,
}

impl UtcOffset {
    pub fn parse(raw: &str) -> Result<Self, LocalTimeError> {
        if raw == "Z" {
            return Ok(Self {
                raw: raw.to_string(),
                seconds: 0,
            });
        }
        let invalid = || LocalTimeError::InvalidOffset(raw.to_string());
        let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
            (1, rest)
        } else if let Some(rest) = raw.strip_prefix('-') {
            (-1, rest)
        } else {
            return Err(invalid());
        };
        let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if hours > 14 || minutes > 59 {
            return Err(invalid());
        }
        Ok(Self {
            raw: raw.to_string(),
            seconds: sign * (hours * 3600 + minutes * 60),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn seconds(&self) -> i32 {
        self.seconds
    }

    pub fn fixed(&self) -> FixedOffset {
        // `parse` bounds the offset to +/-14:59, well inside FixedOffset's range.
        FixedOffset::east_opt(self.seconds).unwrap_or_else(|| Utc.fix())
    }
}

/// Decoded local time: calendar fields plus the offset they were authored in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTime {
    pub fields: NaiveDateTime,
    pub offset: UtcOffset,
}

impl LocalTime {
    pub fn encode(&self) -> String {
        encode(&self.fields, &self.offset)
    }

    /// The instant these fields denote under the carried offset.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.offset
            .fixed()
            .from_local_datetime(&self.fields)
            .single()
            .map(|value| value.with_timezone(&Utc))
    }

    /// The instant these fields denote as wall-clock time in `zone`, falling
    /// back to the carried offset when no zone is known or the local time
    /// does not exist there (spring-forward gap).
    pub fn instant_in(&self, zone: Option<&Tz>) -> Option<DateTime<Utc>> {
        if let Some(zone) = zone {
            if let Some(value) = zone.from_local_datetime(&self.fields).earliest() {
                return Some(value.with_timezone(&Utc));
            }
        }
        self.instant()
    }

    /// [`offset_to_zone_name`] at the instant these fields were authored.
    pub fn guess_zone_name(&self) -> Option<String> {
        self.instant()
            .and_then(|at| offset_to_zone_name(&self.offset, at))
    }

    pub fn with_fields(&self, fields: NaiveDateTime) -> Self {
        Self {
            fields,
            offset: self.offset.clone(),
        }
    }
}

pub fn decode(iso: &str) -> Result<LocalTime, LocalTimeError> {
    let trimmed = iso.trim();
    let captures = LOCAL_TIME_PATTERN
        .captures(trimmed)
        .ok_or_else(|| LocalTimeError::InvalidFormat(iso.to_string()))?;
    let offset_raw = captures
        .get(7)
        .map(|value| value.as_str())
        .ok_or_else(|| LocalTimeError::MissingTimezone(iso.to_string()))?;
    let offset = UtcOffset::parse(offset_raw)?;

    let number = |index: usize| -> u32 {
        captures
            .get(index)
            .and_then(|value| value.as_str().parse().ok())
            .unwrap_or(0)
    };
    let year = captures
        .get(1)
        .and_then(|value| value.as_str().parse::<i32>().ok())
        .ok_or_else(|| LocalTimeError::InvalidFormat(iso.to_string()))?;
    let fields = NaiveDate::from_ymd_opt(year, number(2), number(3))
        .and_then(|date| date.and_hms_opt(number(4), number(5), number(6)))
        .ok_or_else(|| LocalTimeError::InvalidDateTime(iso.to_string()))?;

    Ok(LocalTime { fields, offset })
}

/// Recomposes an ISO string. The offset is written back as given, never
/// recomputed for the target date.
pub fn encode(fields: &NaiveDateTime, offset: &UtcOffset) -> String {
    format!("{}{}", fields.format("%Y-%m-%dT%H:%M:%S"), offset.as_str())
}

pub fn parse_zone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Zones tried in order when only an offset is known. Each offset resolves to
/// the first zone that observes it at the authored instant, so `-05:00` is
/// Chicago in July and New York in January.
const CANDIDATE_ZONES: &[&str] = &[
    "UTC",
    "America/Los_Angeles",
    "America/Denver",
    "America/Chicago",
    "America/New_York",
    "America/Sao_Paulo",
    "America/Halifax",
    "America/Anchorage",
    "Pacific/Honolulu",
    "Europe/Berlin",
    "Europe/Moscow",
    "Europe/Athens",
    "Europe/London",
    "Asia/Dubai",
    "Asia/Kolkata",
    "Asia/Bangkok",
    "Asia/Shanghai",
    "Asia/Tokyo",
    "Australia/Sydney",
    "Pacific/Auckland",
];

/// UTC offset in seconds that `zone` observes at `at`.
pub fn zone_offset_at(zone: &Tz, at: DateTime<Utc>) -> i32 {
    zone.offset_from_utc_datetime(&at.naive_utc())
        .fix()
        .local_minus_utc()
}

/// Best-effort civil zone for an offset observed at `at`. The chosen zone
/// always has that offset at that instant; offsets no candidate observes
/// fall back to a fixed `Etc/GMT` zone when whole-hour. Callers should prefer
/// an explicit zone name whenever the snapshot carries one.
pub fn offset_to_zone_name(offset: &UtcOffset, at: DateTime<Utc>) -> Option<String> {
    let seconds = offset.seconds();
    let observed = CANDIDATE_ZONES.iter().find(|name| {
        parse_zone(name)
            .map(|zone| zone_offset_at(&zone, at) == seconds)
            .unwrap_or(false)
    });
    if let Some(name) = observed {
        return Some(name.to_string());
    }
    // Etc/GMT zones invert the sign: Etc/GMT+5 is five hours behind UTC.
    if seconds % 3600 != 0 {
        return None;
    }
    match seconds / 3600 {
        0 => Some("UTC".to_string()),
        h if h > 0 => Some(format!("Etc/GMT-{}", h)),
        h => Some(format!("Etc/GMT+{}", -h)),
    }
}
