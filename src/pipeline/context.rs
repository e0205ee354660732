use crate::event::CalendarEvent;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Free-form key/value data passed between stages and back to the caller.
pub type Metadata = Map<String, Value>;

/// State threaded through one pipeline run, then discarded.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    /// Raw feed bytes (per-source runs only)
    pub raw_content: Option<Vec<u8>>,
    /// Working event list, rewritten in place by each stage
    pub events: Vec<CalendarEvent>,
    /// Identifiers the caller wants removed
    pub skipped_ids: HashSet<String>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub max_events: Option<usize>,
    /// Reference "now" for the whole run
    pub now: DateTime<Utc>,
    /// Zone used for calendar-date comparisons of all-day events
    pub timezone: Tz,
    /// How far ahead recurring events are expanded
    pub expansion_days: u32,
    /// Side channel for stage-to-stage and stage-to-caller data
    pub extras: Metadata,
}

impl ProcessingContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            raw_content: None,
            events: Vec::new(),
            skipped_ids: HashSet::new(),
            window_start: None,
            window_end: None,
            max_events: None,
            now,
            timezone: Tz::UTC,
            expansion_days: 14,
            extras: Metadata::new(),
        }
    }

    /// Context for a per-source run over raw feed bytes.
    pub fn for_source(raw: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            raw_content: Some(raw),
            ..Self::new(now)
        }
    }

    /// Context for a post-processing run over already-parsed events.
    pub fn for_events(events: Vec<CalendarEvent>, now: DateTime<Utc>) -> Self {
        Self {
            events,
            ..Self::new(now)
        }
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.window_start = start;
        self.window_end = end;
        self
    }

    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }

    pub fn with_skipped(mut self, ids: HashSet<String>) -> Self {
        self.skipped_ids = ids;
        self
    }

    pub fn with_expansion_days(mut self, days: u32) -> Self {
        self.expansion_days = days;
        self
    }
}

/// Outcome of one stage, or the aggregate of a whole pipeline run.
///
/// `events` is only filled on the aggregate of a successful run.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub success: bool,
    pub events: Vec<CalendarEvent>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub events_in: usize,
    pub events_out: usize,
    pub events_filtered: usize,
    pub metadata: Metadata,
}

impl Default for ProcessingResult {
    fn default() -> Self {
        Self {
            success: true,
            events: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            events_in: 0,
            events_out: 0,
            events_filtered: 0,
            metadata: Metadata::new(),
        }
    }
}

impl ProcessingResult {
    /// Successful result for a stage that went from `events_in` to `events_out`.
    ///
    /// The filtered count is the shrinkage; expanding stages report zero.
    pub fn counted(events_in: usize, events_out: usize) -> Self {
        Self {
            events_in,
            events_out,
            events_filtered: events_in.saturating_sub(events_out),
            ..Self::default()
        }
    }

    /// Failed result carrying a single error.
    pub fn failed(error: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.add_error(error);
        result
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        self.success = false;
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.add_warning(warning);
        self
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counted_narrowing() {
        let result = ProcessingResult::counted(10, 7);
        assert!(result.success);
        assert_eq!(result.events_filtered, 3);
    }

    #[test]
    fn test_counted_expanding_reports_zero_filtered() {
        let result = ProcessingResult::counted(2, 9);
        assert_eq!(result.events_filtered, 0);
    }

    #[test]
    fn test_error_flips_success() {
        let mut result = ProcessingResult::counted(1, 1);
        result.add_warning("just a warning");
        assert!(result.success);
        result.add_error("boom");
        assert!(!result.success);
        assert!(result.has_errors());
    }
}
