use crate::event::{Attendee, CalendarEvent, EventKey, Recurrence};
use crate::feed::recurrence::{expand_recurring, instance_id, MAX_INSTANCES_PER_SERIES};
use crate::util::{strip_control_chars, unescape_ics_text};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::parser::{read_calendar, unfold, Component, Property};
use std::collections::HashSet;
use thiserror::Error;

/// Properties that carry a link to an online meeting, in preference order.
const MEETING_URL_PROPERTIES: &[&str] = &[
    "X-MICROSOFT-SKYPETEAMSMEETINGURL",
    "X-GOOGLE-CONFERENCE",
    "URL",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Feed is not valid UTF-8")]
    InvalidUtf8,
    #[error("Feed does not contain a VCALENDAR")]
    NotACalendar,
    #[error("Malformed calendar: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("Invalid recurrence rule for '{uid}': {reason}")]
    InvalidRule { uid: String, reason: String },
}

/// Events parsed from one feed plus non-fatal problems found on the way.
#[derive(Debug, Default)]
pub struct ParsedFeed {
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<String>,
    /// `X-WR-CALNAME`
    pub calendar_name: Option<String>,
    /// `X-WR-TIMEZONE`
    pub timezone: Option<String>,
}

/// Result of expanding recurring masters; rule problems are warnings.
#[derive(Debug, Default)]
pub struct Expansion {
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<String>,
}

/// Turns recurring masters into dated instances.
pub trait RecurrenceExpander: Send + Sync {
    fn expand(
        &self,
        events: Vec<CalendarEvent>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Expansion;
}

/// Converts raw feed bytes into events.
pub trait CalendarParser: Send + Sync {
    fn parse(&self, raw: &[u8]) -> Result<ParsedFeed, ParseError>;

    /// Recurrence expansion capability, when the parser has one.
    fn expander(&self) -> Option<&dyn RecurrenceExpander> {
        None
    }
}

/// iCalendar parser backed by the `icalendar` crate, with RRULE expansion.
#[derive(Debug, Clone)]
pub struct IcsParser {
    /// Zone for floating times when the feed declares none
    default_timezone: Tz,
}

impl Default for IcsParser {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl IcsParser {
    pub fn new(default_timezone: Tz) -> Self {
        Self { default_timezone }
    }
}

impl CalendarParser for IcsParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedFeed, ParseError> {
        let content = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
        if !content.contains("BEGIN:VCALENDAR") {
            return Err(ParseError::NotACalendar);
        }

        let unfolded = unfold(content);
        let calendar = read_calendar(&unfolded).map_err(|e| ParseError::Malformed(e.to_string()))?;

        let calendar_prop = |name: &str| {
            calendar
                .properties
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.val.to_string())
        };
        let calendar_name = calendar_prop("X-WR-CALNAME");
        let timezone = calendar_prop("X-WR-TIMEZONE");

        let floating_tz = match timezone.as_deref().map(str::parse::<Tz>) {
            Some(Ok(tz)) => tz,
            _ => self.default_timezone,
        };

        let mut parsed = ParsedFeed {
            calendar_name,
            timezone,
            ..ParsedFeed::default()
        };

        for vevent in calendar.components.iter().filter(|c| c.name == "VEVENT") {
            match parse_vevent(vevent, floating_tz, &mut parsed.warnings) {
                Some(event) => parsed.events.push(event),
                None => parsed
                    .warnings
                    .push("Skipped VEVENT without UID or valid DTSTART".to_string()),
            }
        }

        Ok(parsed)
    }

    fn expander(&self) -> Option<&dyn RecurrenceExpander> {
        Some(self)
    }
}

impl RecurrenceExpander for IcsParser {
    fn expand(
        &self,
        events: Vec<CalendarEvent>,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Expansion {
        // Explicit overrides replace the generated instance they stand for
        let overrides: HashSet<EventKey> = events
            .iter()
            .filter(|e| e.recurrence_instance_id.is_some())
            .map(CalendarEvent::key)
            .collect();

        let mut expansion = Expansion::default();
        for event in events {
            if !event.is_recurring_master() {
                expansion.events.push(event);
                continue;
            }

            match expand_recurring(
                &event,
                range_start,
                range_end,
                &overrides,
                MAX_INSTANCES_PER_SERIES,
            ) {
                Ok(instances) => expansion.events.extend(instances),
                Err(e) => {
                    expansion.warnings.push(e.to_string());
                    expansion.events.push(event);
                }
            }
        }
        expansion
    }
}

/// A DTSTART/DTEND/RECURRENCE-ID/EXDATE value before zone resolution.
#[derive(Debug, Clone, PartialEq)]
enum IcsTime {
    Date(NaiveDate),
    Utc(DateTime<Utc>),
    Floating(NaiveDateTime),
    Zoned { datetime: NaiveDateTime, tzid: String },
}

impl IcsTime {
    fn is_date(&self) -> bool {
        matches!(self, IcsTime::Date(_))
    }

    /// All-day dates become midnight UTC; unknown TZIDs fall back to `floating_tz`.
    fn to_utc(&self, floating_tz: Tz, warnings: &mut Vec<String>) -> Option<DateTime<Utc>> {
        match self {
            IcsTime::Date(d) => Some(d.and_hms_opt(0, 0, 0)?.and_utc()),
            IcsTime::Utc(dt) => Some(*dt),
            IcsTime::Floating(naive) => local_to_utc(floating_tz, naive),
            IcsTime::Zoned { datetime, tzid } => match tzid.parse::<Tz>() {
                Ok(tz) => local_to_utc(tz, datetime),
                Err(_) => {
                    warnings.push(format!("Unknown TZID '{tzid}', using {floating_tz}"));
                    local_to_utc(floating_tz, datetime)
                }
            },
        }
    }
}

fn local_to_utc(tz: Tz, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
    // Gaps (spring forward) have no mapping; shift an hour forward like most clients
    tz.from_local_datetime(naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(*naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

fn param(prop: &Property, key: &str) -> Option<String> {
    prop.params
        .iter()
        .find(|p| p.key == key)
        .and_then(|p| p.val.as_ref().map(|v| v.to_string()))
}

fn parse_time_value(value: &str, tzid: Option<&str>, is_date: bool) -> Option<IcsTime> {
    let value = value.trim();
    if is_date || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit())) {
        return NaiveDate::parse_from_str(value, "%Y%m%d").ok().map(IcsTime::Date);
    }
    if let Some(utc) = value.strip_suffix('Z') {
        return NaiveDateTime::parse_from_str(utc, "%Y%m%dT%H%M%S")
            .ok()
            .map(|dt| IcsTime::Utc(dt.and_utc()));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    Some(match tzid {
        Some(tzid) => IcsTime::Zoned {
            datetime: naive,
            tzid: tzid.to_string(),
        },
        None => IcsTime::Floating(naive),
    })
}

/// Parse a property that may hold a comma-separated list of times (EXDATE).
fn parse_time_property(prop: &Property) -> Vec<IcsTime> {
    let tzid = param(prop, "TZID");
    let is_date = param(prop, "VALUE").as_deref() == Some("DATE");
    prop.val
        .as_ref()
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| parse_time_value(s, tzid.as_deref(), is_date))
        .collect()
}

fn first_time(vevent: &Component, name: &str) -> Option<IcsTime> {
    vevent
        .find_prop(name)
        .and_then(|p| parse_time_property(p).into_iter().next())
}

fn clean_text(raw: &str) -> String {
    strip_control_chars(&unescape_ics_text(raw)).trim().to_string()
}

fn text_prop(vevent: &Component, name: &str) -> Option<String> {
    vevent
        .find_prop(name)
        .map(|p| clean_text(p.val.as_ref()))
        .filter(|s| !s.is_empty())
}

fn parse_attendee(prop: &Property) -> Attendee {
    let value = prop.val.as_ref();
    let email = value
        .strip_prefix("mailto:")
        .or_else(|| value.strip_prefix("MAILTO:"))
        .unwrap_or(value)
        .to_string();
    Attendee {
        email,
        name: param(prop, "CN").map(|cn| clean_text(&cn)),
    }
}

/// `DURATION` (`PT1H`, `P1D`, `P2W`), used when there is no `DTEND`.
/// Negative or unreadable values are ignored.
fn event_duration(vevent: &Component) -> Option<Duration> {
    let value = vevent.find_prop("DURATION")?.val.as_str().trim();
    let value = value.strip_prefix('+').unwrap_or(value);
    let duration = iso8601::duration(value).ok()?;
    let std_duration: std::time::Duration = duration.into();
    Duration::from_std(std_duration).ok()
}

fn parse_vevent(vevent: &Component, floating_tz: Tz, warnings: &mut Vec<String>) -> Option<CalendarEvent> {
    let uid = vevent.find_prop("UID")?.val.to_string();
    if uid.trim().is_empty() {
        return None;
    }

    let start_raw = first_time(vevent, "DTSTART")?;
    let start = start_raw.to_utc(floating_tz, warnings)?;
    let is_all_day = start_raw.is_date();

    let end = first_time(vevent, "DTEND")
        .and_then(|t| t.to_utc(floating_tz, warnings))
        .or_else(|| event_duration(vevent).map(|d| start + d))
        .filter(|end| *end >= start)
        .unwrap_or_else(|| {
            if is_all_day {
                start + Duration::days(1)
            } else {
                start
            }
        });

    let event_tzid = vevent.find_prop("DTSTART").and_then(|p| param(p, "TZID"));

    let recurrence_instance_id = first_time(vevent, "RECURRENCE-ID")
        .and_then(|t| {
            let utc = t.to_utc(floating_tz, warnings)?;
            Some(instance_id(utc, t.is_date()))
        });

    let recurrence = vevent.find_prop("RRULE").map(|rule| {
        let exdates = vevent
            .properties
            .iter()
            .filter(|p| p.name == "EXDATE")
            .flat_map(parse_time_property)
            .filter_map(|t| t.to_utc(floating_tz, warnings))
            .collect();
        Recurrence {
            rule: rule.val.to_string(),
            exdates,
            tzid: event_tzid.clone(),
        }
    });

    let online_meeting_url = MEETING_URL_PROPERTIES
        .iter()
        .find_map(|name| vevent.find_prop(name))
        .map(|p| p.val.to_string())
        .filter(|s| !s.trim().is_empty());

    let attendees = vevent
        .properties
        .iter()
        .filter(|p| p.name == "ATTENDEE")
        .map(parse_attendee)
        .collect();

    Some(CalendarEvent {
        id: uid,
        is_recurring: recurrence.is_some() || recurrence_instance_id.is_some(),
        recurrence_instance_id,
        subject: text_prop(vevent, "SUMMARY").unwrap_or_else(|| "(No title)".to_string()),
        description: text_prop(vevent, "DESCRIPTION"),
        location: text_prop(vevent, "LOCATION"),
        online_meeting_url,
        start,
        end,
        timezone: event_tzid,
        attendees,
        is_all_day,
        recurrence,
    })
}
