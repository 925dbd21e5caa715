//! iCalendar (RFC 5545) artifacts for reminder invites and cancellations.
//!
//! Every artifact for one logical reminder reuses the reminder uid so mail
//! clients fold the whole history into a single event.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

use super::local_time::{decode, parse_zone, zone_offset_at, LocalTime, LocalTimeError};
use super::types::{Reminder, ReminderStatus};

const PRODID: &str = "-//reminder_module//Reminder Lifecycle//EN";
const DEFAULT_CANCEL_DESCRIPTION: &str = "This reminder was cancelled.";

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("missing timezone for reminder {0}")]
    MissingTimezone(String),
    #[error("unknown timezone {0}")]
    UnknownTimezone(String),
    #[error("organizer email is not configured")]
    MissingOrganizer,
    #[error("local time error: {0}")]
    LocalTime(#[from] LocalTimeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarMethod {
    Request,
    Cancel,
}

impl CalendarMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarMethod::Request => "REQUEST",
            CalendarMethod::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Confirmed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipationStatus {
    Accepted,
    NeedsAction,
}

impl ParticipationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipationStatus::Accepted => "ACCEPTED",
            ParticipationStatus::NeedsAction => "NEEDS-ACTION",
        }
    }
}

/// How `SEQUENCE` is assigned to updates.
///
/// `Fixed` always writes 1 for updates and fire-time invites. `Revision`
/// uses the number of earlier snapshots of the uid in the thread, plus one
/// for fire-time invites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SequencePolicy {
    #[default]
    Fixed,
    Revision,
}

impl FromStr for SequencePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(SequencePolicy::Fixed),
            "revision" => Ok(SequencePolicy::Revision),
            other => Err(format!("unknown sequence policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarIdentity {
    pub email: String,
    pub name: Option<String>,
}

impl CalendarIdentity {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `Name <email>` for mail headers, or the bare address.
    pub fn mailbox(&self) -> String {
        match self.name.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(name) => format!("{} <{}>", name, self.email.trim()),
            None => self.email.trim().to_string(),
        }
    }

    fn property(&self, name: &str, params: &str) -> String {
        let cn = self
            .name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!(";CN={}", quote_param(value)))
            .unwrap_or_default();
        format!("{}{}{}:mailto:{}", name, cn, params, self.email.trim())
    }
}

/// A serializable calendar attachment ready for the outbound mail boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarAttachment {
    pub filename: String,
    pub content_type: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarArtifact {
    pub uid: String,
    pub sequence: u32,
    pub method: CalendarMethod,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub time_zone: String,
    pub organizer: CalendarIdentity,
    pub attendee: CalendarIdentity,
    pub attendee_status: ParticipationStatus,
    pub status: EventStatus,
    pub summary: String,
    pub description: String,
}

impl CalendarArtifact {
    pub fn to_ics(&self, dtstamp: DateTime<Utc>) -> String {
        let mut out = String::new();
        let mut push = |line: String| out.push_str(&fold_line(&line));

        push("BEGIN:VCALENDAR".to_string());
        push("VERSION:2.0".to_string());
        push(format!("PRODID:{}", PRODID));
        push("CALSCALE:GREGORIAN".to_string());
        push(format!("METHOD:{}", self.method.as_str()));
        if let Some(zone) = parse_zone(&self.time_zone) {
            for line in vtimezone(&zone, &self.time_zone, &self.start) {
                push(line);
            }
        }
        push("BEGIN:VEVENT".to_string());
        push(format!("UID:{}", self.uid));
        push(format!("SEQUENCE:{}", self.sequence));
        push(format!("DTSTAMP:{}", dtstamp.format("%Y%m%dT%H%M%SZ")));
        push(format!(
            "DTSTART;TZID={}:{}",
            self.time_zone,
            format_local(&self.start)
        ));
        push(format!(
            "DTEND;TZID={}:{}",
            self.time_zone,
            format_local(&self.end)
        ));
        push(format!("SUMMARY:{}", escape_text(&self.summary)));
        if !self.description.is_empty() {
            push(format!("DESCRIPTION:{}", escape_text(&self.description)));
        }
        push(self.organizer.property("ORGANIZER", ""));
        push(self.attendee.property(
            "ATTENDEE",
            &format!(
                ";ROLE=REQ-PARTICIPANT;PARTSTAT={};RSVP=FALSE",
                self.attendee_status.as_str()
            ),
        ));
        push(format!("STATUS:{}", self.status.as_str()));
        push("TRANSP:OPAQUE".to_string());
        if self.method == CalendarMethod::Request {
            push("BEGIN:VALARM".to_string());
            push("ACTION:DISPLAY".to_string());
            push(format!("DESCRIPTION:{}", escape_text(&self.summary)));
            push("TRIGGER:-PT0M".to_string());
            push("END:VALARM".to_string());
        }
        push("END:VEVENT".to_string());
        push("END:VCALENDAR".to_string());
        out
    }

    pub fn to_attachment(&self, dtstamp: DateTime<Utc>) -> CalendarAttachment {
        CalendarAttachment {
            filename: format!("{}.ics", self.uid),
            content_type: format!(
                "text/calendar; charset=utf-8; method={}",
                self.method.as_str()
            ),
            content: self.to_ics(dtstamp),
        }
    }
}

impl fmt::Display for CalendarArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uid={} seq={} start={} tz={}",
            self.method.as_str(),
            self.uid,
            self.sequence,
            format_local(&self.start),
            self.time_zone
        )
    }
}

#[derive(Debug, Clone)]
pub struct CalendarBuilder {
    organizer: CalendarIdentity,
    duration: Duration,
    sequence_policy: SequencePolicy,
}

impl CalendarBuilder {
    pub fn new(
        organizer: CalendarIdentity,
        duration: Duration,
        sequence_policy: SequencePolicy,
    ) -> Self {
        Self {
            organizer,
            duration,
            sequence_policy,
        }
    }

    pub fn sequence_policy(&self) -> SequencePolicy {
        self.sequence_policy
    }

    pub fn organizer(&self) -> &CalendarIdentity {
        &self.organizer
    }

    /// Artifact for a snapshot as received: REQUEST for new/updated, CANCEL
    /// for cancelled. `revision` counts earlier snapshots of the same uid.
    pub fn for_snapshot(
        &self,
        reminder: &Reminder,
        attendee: &CalendarIdentity,
        time_zone: Option<&str>,
        revision: u32,
    ) -> Result<CalendarArtifact, CalendarError> {
        let start = decode(&reminder.date_time)?;
        let (method, status, attendee_status, sequence) = match reminder.status {
            ReminderStatus::New => (
                CalendarMethod::Request,
                EventStatus::Confirmed,
                ParticipationStatus::Accepted,
                0,
            ),
            ReminderStatus::Updated => (
                CalendarMethod::Request,
                EventStatus::Confirmed,
                ParticipationStatus::NeedsAction,
                self.update_sequence(revision),
            ),
            ReminderStatus::Cancelled => (
                CalendarMethod::Cancel,
                EventStatus::Cancelled,
                ParticipationStatus::NeedsAction,
                self.update_sequence(revision),
            ),
        };
        let description = if reminder.is_cancelled() {
            reminder
                .cancellation_reason()
                .map(|reason| format!("Cancelled: {}", reason))
                .unwrap_or_else(|| DEFAULT_CANCEL_DESCRIPTION.to_string())
        } else {
            describe(reminder)
        };
        self.assemble(
            reminder,
            &start,
            attendee,
            time_zone,
            Assembly {
                method,
                status,
                attendee_status,
                sequence,
                description,
            },
        )
    }

    /// Artifact describing the occurrence after the one that just fired.
    pub fn for_next_occurrence(
        &self,
        reminder: &Reminder,
        next: &LocalTime,
        attendee: &CalendarIdentity,
        time_zone: Option<&str>,
        revision: u32,
    ) -> Result<CalendarArtifact, CalendarError> {
        let sequence = match self.sequence_policy {
            SequencePolicy::Fixed => 1,
            SequencePolicy::Revision => revision.saturating_add(1),
        };
        self.assemble(
            reminder,
            next,
            attendee,
            time_zone,
            Assembly {
                method: CalendarMethod::Request,
                status: EventStatus::Confirmed,
                attendee_status: ParticipationStatus::NeedsAction,
                sequence,
                description: describe(reminder),
            },
        )
    }

    fn update_sequence(&self, revision: u32) -> u32 {
        match self.sequence_policy {
            SequencePolicy::Fixed => 1,
            SequencePolicy::Revision => revision.max(1),
        }
    }

    fn assemble(
        &self,
        reminder: &Reminder,
        start: &LocalTime,
        attendee: &CalendarIdentity,
        time_zone: Option<&str>,
        assembly: Assembly,
    ) -> Result<CalendarArtifact, CalendarError> {
        let time_zone = time_zone
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CalendarError::MissingTimezone(reminder.uid.clone()))?;
        if parse_zone(time_zone).is_none() {
            return Err(CalendarError::UnknownTimezone(time_zone.to_string()));
        }
        if self.organizer.email.trim().is_empty() {
            return Err(CalendarError::MissingOrganizer);
        }
        let end = start
            .fields
            .checked_add_signed(self.duration)
            .unwrap_or(start.fields);
        Ok(CalendarArtifact {
            uid: reminder.uid.clone(),
            sequence: assembly.sequence,
            method: assembly.method,
            start: start.fields,
            end,
            time_zone: time_zone.to_string(),
            organizer: self.organizer.clone(),
            attendee: attendee.clone(),
            attendee_status: assembly.attendee_status,
            status: assembly.status,
            summary: reminder.title().to_string(),
            description: assembly.description,
        })
    }
}

struct Assembly {
    method: CalendarMethod,
    status: EventStatus,
    attendee_status: ParticipationStatus,
    sequence: u32,
    description: String,
}

fn describe(reminder: &Reminder) -> String {
    let description = reminder.contextual_description.trim();
    if !description.is_empty() {
        return description.to_string();
    }
    reminder.text.trim().to_string()
}

/// One offset change: local wall time it takes effect (in the old offset),
/// offset before and offset after, in seconds east of UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Transition {
    local: NaiveDateTime,
    from: i32,
    to: i32,
}

/// Offset changes of `zone` within a year either side of `around` (UTC).
fn transitions(zone: &Tz, around: DateTime<Utc>) -> Vec<Transition> {
    let step = Duration::minutes(15);
    let end = around + Duration::days(366);
    let mut day = around - Duration::days(366);
    let mut current = zone_offset_at(zone, day);
    let mut found = Vec::new();
    while day < end {
        let next_day = day + Duration::days(1);
        if zone_offset_at(zone, next_day) != current {
            let mut at = day + step;
            while at <= next_day {
                let offset = zone_offset_at(zone, at);
                if offset != current {
                    found.push(Transition {
                        local: at.naive_utc() + Duration::seconds(i64::from(current)),
                        from: current,
                        to: offset,
                    });
                    current = offset;
                }
                at += step;
            }
        }
        day = next_day;
    }
    found
}

fn format_utc_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.abs() / 60;
    format!("{}{:02}{:02}", sign, minutes / 60, minutes % 60)
}

/// VTIMEZONE lines for `tzid`, covering the observances around `start`.
fn vtimezone(zone: &Tz, tzid: &str, start: &NaiveDateTime) -> Vec<String> {
    let around = zone
        .from_local_datetime(start)
        .earliest()
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(start));
    let mut lines = vec!["BEGIN:VTIMEZONE".to_string(), format!("TZID:{}", tzid)];
    let changes = transitions(zone, around);
    if changes.is_empty() {
        let offset = format_utc_offset(zone_offset_at(zone, around));
        lines.push("BEGIN:STANDARD".to_string());
        lines.push("DTSTART:19700101T000000".to_string());
        lines.push(format!("TZOFFSETFROM:{}", offset));
        lines.push(format!("TZOFFSETTO:{}", offset));
        lines.push("END:STANDARD".to_string());
    }
    for change in changes {
        let kind = if change.to > change.from {
            "DAYLIGHT"
        } else {
            "STANDARD"
        };
        lines.push(format!("BEGIN:{}", kind));
        lines.push(format!("DTSTART:{}", format_local(&change.local)));
        lines.push(format!("TZOFFSETFROM:{}", format_utc_offset(change.from)));
        lines.push(format!("TZOFFSETTO:{}", format_utc_offset(change.to)));
        lines.push(format!("END:{}", kind));
    }
    lines.push("END:VTIMEZONE".to_string());
    lines
}

fn format_local(value: &NaiveDateTime) -> String {
    value.format("%Y%m%dT%H%M%S").to_string()
}

/// Emit `s` as one content line, folding at 75 octets with CRLF + SP.
fn fold_line(s: &str) -> String {
    if s.len() <= 75 {
        return format!("{}\r\n", s);
    }
    let mut result = String::new();
    let mut pos = 0usize;
    let mut first = true;
    while pos < s.len() {
        let limit = if first { 75 } else { 74 };
        let end = if pos + limit >= s.len() {
            s.len()
        } else {
            let mut end = pos + limit;
            while end > pos && !s.is_char_boundary(end) {
                end -= 1;
            }
            if end == pos {
                pos + 1
            } else {
                end
            }
        };
        if !first {
            result.push(' ');
        }
        result.push_str(&s[pos..end]);
        result.push_str("\r\n");
        pos = end;
        first = false;
    }
    result
}

fn escape_text(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace("\r\n", "\\n")
        .replace('\n', "\\n")
}

fn quote_param(s: &str) -> String {
    let cleaned = s.replace('"', "'");
    if cleaned.contains([':', ';', ',']) {
        format!("\"{}\"", cleaned)
    } else {
        cleaned
    }
}
