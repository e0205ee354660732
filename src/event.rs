//! Calendar event model shared by the parser, the processing pipelines and
//! the published window.
//!
//! Events are plain values: once a [`CalendarEvent`] is built it is only ever
//! cloned or replaced, never edited in place by a stage that does not own it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

/// A single attendee as listed by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attendee {
    pub email: String,
    pub name: Option<String>,
}

/// Recurrence rule carried by a master event until it is expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recurrence {
    /// Raw RRULE value, e.g. `FREQ=WEEKLY;BYDAY=MO`
    pub rule: String,
    /// Occurrence starts excluded from the series
    pub exdates: Vec<DateTime<Utc>>,
    /// TZID of the master's DTSTART, used to keep local wall-clock times across DST
    pub tzid: Option<String>,
}

/// Composite identity used for de-duplication.
///
/// An override instance of a recurring series shares its `id` with the
/// master, so identity must include the recurrence instance as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub id: String,
    pub recurrence_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarEvent {
    /// Stable identifier (ICS UID)
    pub id: String,
    /// Distinguishes an expanded occurrence or an override from its master
    pub recurrence_instance_id: Option<String>,
    pub subject: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub online_meeting_url: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Time zone the source declared for this event, if any
    pub timezone: Option<String>,
    pub attendees: Vec<Attendee>,
    pub is_all_day: bool,
    pub is_recurring: bool,
    #[serde(skip)]
    pub recurrence: Option<Recurrence>,
}

impl CalendarEvent {
    /// Build a timed event with no optional fields set.
    pub fn new(
        id: impl Into<String>,
        subject: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            recurrence_instance_id: None,
            subject: subject.into(),
            description: None,
            location: None,
            online_meeting_url: None,
            start,
            end,
            timezone: None,
            attendees: Vec::new(),
            is_all_day: false,
            is_recurring: false,
            recurrence: None,
        }
    }

    /// Build an all-day event stored as midnight UTC of `date`, spanning `days` days.
    pub fn all_day(
        id: impl Into<String>,
        subject: impl Into<String>,
        date: NaiveDate,
        days: i64,
    ) -> Self {
        let start = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        let mut event = Self::new(id, subject, start, start + Duration::days(days.max(1)));
        event.is_all_day = true;
        event
    }

    pub fn with_recurrence_instance(mut self, instance: impl Into<String>) -> Self {
        self.recurrence_instance_id = Some(instance.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_online_meeting_url(mut self, url: impl Into<String>) -> Self {
        self.online_meeting_url = Some(url.into());
        self
    }

    pub fn with_attendees(mut self, attendees: Vec<Attendee>) -> Self {
        self.attendees = attendees;
        self
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.is_recurring = true;
        self.recurrence = Some(recurrence);
        self
    }

    pub fn key(&self) -> EventKey {
        EventKey {
            id: self.id.clone(),
            recurrence_instance: self.recurrence_instance_id.clone(),
        }
    }

    /// Score used to pick the richer of two duplicates.
    ///
    /// +1 description, +2 attendees, +1 location, +1 online meeting link.
    pub fn information_score(&self) -> u32 {
        let present = |s: &Option<String>| s.as_deref().is_some_and(|v| !v.trim().is_empty());

        let mut score = 0;
        if present(&self.description) {
            score += 1;
        }
        if !self.attendees.is_empty() {
            score += 2;
        }
        if present(&self.location) {
            score += 1;
        }
        if present(&self.online_meeting_url) {
            score += 1;
        }
        score
    }

    /// First and last calendar date covered by an all-day event.
    ///
    /// All-day events are stored as midnight UTC with an exclusive end, so
    /// the dates are read straight off the UTC timestamps.
    pub fn all_day_dates(&self) -> (NaiveDate, NaiveDate) {
        let first = self.start.date_naive();
        let end_exclusive = self.end.date_naive();
        let last = if end_exclusive > first {
            end_exclusive.pred_opt().unwrap_or(first)
        } else {
            first
        };
        (first, last)
    }

    /// A master event still carrying an unexpanded rule.
    pub fn is_recurring_master(&self) -> bool {
        self.recurrence.is_some() && self.recurrence_instance_id.is_none()
    }
}
