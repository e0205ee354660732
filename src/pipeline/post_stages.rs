//! Stages run once per refresh over the union of every source's events.

use super::{Pipeline, ProcessingContext, ProcessingResult, Stage};
use crate::event::CalendarEvent;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;

/// Skipped filter → Time window → Limit.
pub fn post_pipeline() -> Pipeline {
    Pipeline::new()
        .with_stage(SkippedFilterStage)
        .with_stage(TimeWindowStage)
        .with_stage(LimitStage)
}

/// Drops events whose identifier is in `ctx.skipped_ids`.
pub struct SkippedFilterStage;

impl Stage for SkippedFilterStage {
    fn name(&self) -> &str {
        "skipped_filter"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let events_in = ctx.events.len();
        if !ctx.skipped_ids.is_empty() {
            let skipped = &ctx.skipped_ids;
            ctx.events.retain(|e| !skipped.contains(&e.id));
        }
        ProcessingResult::counted(events_in, ctx.events.len())
    }
}

/// Keeps events overlapping `[window_start, window_end)`.
///
/// Timed events are kept until they end, so an in-progress meeting stays
/// visible. All-day events are compared by calendar date in `ctx.timezone`:
/// they are stored as midnight UTC, which is the wrong instant in every
/// zone but UTC.
pub struct TimeWindowStage;

impl TimeWindowStage {
    fn keep_timed(event: &CalendarEvent, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> bool {
        let not_ended = start.map_or(true, |start| {
            if event.end > event.start {
                event.end > start
            } else {
                event.start >= start
            }
        });
        let started_before_end = end.map_or(true, |end| event.start < end);
        not_ended && started_before_end
    }

    fn keep_all_day(event: &CalendarEvent, first: Option<NaiveDate>, last: Option<NaiveDate>) -> bool {
        let (event_first, event_last) = event.all_day_dates();
        first.map_or(true, |first| event_last >= first) && last.map_or(true, |last| event_first <= last)
    }

    /// Local calendar dates covered by the window; the end bound is exclusive.
    fn local_dates(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        tz: Tz,
    ) -> (Option<NaiveDate>, Option<NaiveDate>) {
        let first = start.map(|s| s.with_timezone(&tz).date_naive());
        let last = end.map(|e| (e - Duration::seconds(1)).with_timezone(&tz).date_naive());
        (first, last)
    }
}

impl Stage for TimeWindowStage {
    fn name(&self) -> &str {
        "time_window"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let events_in = ctx.events.len();
        let (start, end) = (ctx.window_start, ctx.window_end);
        if start.is_none() && end.is_none() {
            return ProcessingResult::counted(events_in, events_in);
        }

        let (first_date, last_date) = Self::local_dates(start, end, ctx.timezone);
        ctx.events.retain(|event| {
            if event.is_all_day {
                Self::keep_all_day(event, first_date, last_date)
            } else {
                Self::keep_timed(event, start, end)
            }
        });

        ProcessingResult::counted(events_in, ctx.events.len())
    }
}

/// Truncates an already time-sorted list to the first `ctx.max_events`.
pub struct LimitStage;

impl Stage for LimitStage {
    fn name(&self) -> &str {
        "limit"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let events_in = ctx.events.len();
        if let Some(max) = ctx.max_events {
            ctx.events.truncate(max);
        }
        ProcessingResult::counted(events_in, ctx.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 20, 12, 0, 0).unwrap()
    }

    fn at(h: i64) -> DateTime<Utc> {
        now() + Duration::hours(h)
    }

    fn ids(events: &[CalendarEvent]) -> Vec<String> {
        events.iter().map(|e| e.id.clone()).collect()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_skipped_filter_removes_ids() {
        let events = vec![
            CalendarEvent::new("keep", "K", at(1), at(2)),
            CalendarEvent::new("drop", "D", at(1), at(2)),
        ];
        let skipped: HashSet<String> = ["drop".to_string()].into_iter().collect();
        let mut ctx = ProcessingContext::for_events(events, now()).with_skipped(skipped);

        let result = SkippedFilterStage.process(&mut ctx);
        assert_eq!(result.events_filtered, 1);
        assert_eq!(ids(&ctx.events), vec!["keep"]);
    }

    #[test]
    fn test_skipped_filter_empty_set_is_noop() {
        let mut ctx =
            ProcessingContext::for_events(vec![CalendarEvent::new("a", "A", at(1), at(2))], now());
        let result = SkippedFilterStage.process(&mut ctx);
        assert!(result.success);
        assert_eq!(result.events_filtered, 0);
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_time_window_timed_events() {
        let events = vec![
            CalendarEvent::new("ended", "E", at(-3), at(-2)),
            CalendarEvent::new("in_progress", "P", at(-1), at(1)),
            CalendarEvent::new("upcoming", "U", at(2), at(3)),
            CalendarEvent::new("after_end", "A", at(30), at(31)),
            CalendarEvent::new("zero_length_now", "Z", now(), now()),
        ];
        let mut ctx =
            ProcessingContext::for_events(events, now()).with_window(Some(now()), Some(at(24)));

        let result = TimeWindowStage.process(&mut ctx);
        assert_eq!(ids(&ctx.events), vec!["in_progress", "upcoming", "zero_length_now"]);
        assert_eq!(result.events_filtered, 2);
    }

    #[test]
    fn test_time_window_open_end() {
        let events = vec![
            CalendarEvent::new("ended", "E", at(-3), at(-2)),
            CalendarEvent::new("far", "F", at(500), at(501)),
        ];
        let mut ctx = ProcessingContext::for_events(events, now()).with_window(Some(now()), None);

        TimeWindowStage.process(&mut ctx);
        assert_eq!(ids(&ctx.events), vec!["far"]);
    }

    #[test]
    fn test_time_window_without_bounds_is_noop() {
        let mut ctx = ProcessingContext::for_events(
            vec![CalendarEvent::new("old", "O", at(-100), at(-99))],
            now(),
        );
        let result = TimeWindowStage.process(&mut ctx);
        assert_eq!(result.events_filtered, 0);
    }

    #[test]
    fn test_all_day_matches_local_today_in_every_zone() {
        let zones = [
            "Pacific/Kiritimati",
            "Pacific/Auckland",
            "Asia/Tokyo",
            "Asia/Kolkata",
            "Europe/Berlin",
            "UTC",
            "America/Sao_Paulo",
            "America/New_York",
            "America/Los_Angeles",
            "Pacific/Honolulu",
            "Pacific/Pago_Pago",
        ];

        for name in zones {
            let tz: Tz = name.parse().unwrap();
            let local_today = now().with_timezone(&tz).date_naive();
            let midnight = tz
                .from_local_datetime(&local_today.and_time(NaiveTime::MIN))
                .earliest()
                .unwrap()
                .with_timezone(&Utc);
            let window_end = midnight + Duration::days(1);

            let events = vec![
                CalendarEvent::all_day("today", "Today", local_today, 1),
                CalendarEvent::all_day("yesterday", "Yesterday", local_today.pred_opt().unwrap(), 1),
                CalendarEvent::all_day("tomorrow", "Tomorrow", local_today.succ_opt().unwrap(), 1),
            ];
            let mut ctx = ProcessingContext::for_events(events, now())
                .with_timezone(tz)
                .with_window(Some(midnight), Some(window_end));

            TimeWindowStage.process(&mut ctx);
            assert_eq!(ids(&ctx.events), vec!["today"], "zone {name}");
        }
    }

    #[test]
    fn test_multi_day_all_day_overlapping_window() {
        let conference = CalendarEvent::all_day("conf", "Conference", date(2025, 3, 18), 4);
        let mut ctx = ProcessingContext::for_events(vec![conference], now())
            .with_window(Some(now()), Some(now() + Duration::hours(1)));

        TimeWindowStage.process(&mut ctx);
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_limit_truncates_keeping_earliest() {
        let events = (0..5)
            .map(|i| CalendarEvent::new(format!("e{i}"), "E", at(i), at(i + 1)))
            .collect();
        let mut ctx = ProcessingContext::for_events(events, now()).with_max_events(3);

        let result = LimitStage.process(&mut ctx);
        assert_eq!(result.events_filtered, 2);
        assert_eq!(ids(&ctx.events), vec!["e0", "e1", "e2"]);
    }

    #[test]
    fn test_limit_under_cap_is_noop() {
        let mut ctx =
            ProcessingContext::for_events(vec![CalendarEvent::new("a", "A", at(1), at(2))], now())
                .with_max_events(10);
        let result = LimitStage.process(&mut ctx);
        assert_eq!(result.events_filtered, 0);
        assert_eq!(ctx.events.len(), 1);
    }

    #[test]
    fn test_post_pipeline_counts() {
        let events = vec![
            CalendarEvent::new("skip_me", "S", at(1), at(2)),
            CalendarEvent::new("old", "O", at(-50), at(-49)),
            CalendarEvent::new("a", "A", at(1), at(2)),
            CalendarEvent::new("b", "B", at(2), at(3)),
            CalendarEvent::new("c", "C", at(3), at(4)),
        ];
        let ctx = ProcessingContext::for_events(events, now())
            .with_skipped(["skip_me".to_string()].into_iter().collect())
            .with_window(Some(at(-24)), None)
            .with_max_events(2);

        let result = post_pipeline().run(ctx);
        assert!(result.success);
        assert_eq!(ids(&result.events), vec!["a", "b"]);
        assert_eq!(result.events_in, 5);
        assert_eq!(result.events_out, 2);
        assert_eq!(result.events_filtered, 3);
    }
}
