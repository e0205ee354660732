//! RRULE expansion for recurring events.
//!
//! Expands a master recurring event into dated instances within a range,
//! respecting EXDATEs and skipping occurrences that have an explicit override.

use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::event::{CalendarEvent, EventKey};
use crate::feed::parser::ExpandError;

/// Upper bound on generated instances for one series.
pub const MAX_INSTANCES_PER_SERIES: u16 = 1000;

/// Canonical recurrence-instance identifier for an occurrence start.
///
/// Both explicit overrides (RECURRENCE-ID) and generated instances use this
/// form so the two can be matched.
pub fn instance_id(start: DateTime<Utc>, is_date: bool) -> String {
    if is_date {
        start.format("%Y%m%d").to_string()
    } else {
        start.format("%Y%m%dT%H%M%SZ").to_string()
    }
}

/// Build an iCalendar-format DTSTART + RRULE block for the rrule crate parser.
///
/// Zoned masters keep their TZID so weekly meetings stay at the same local
/// time across DST changes; all-day and UTC masters are expressed in UTC.
/// Either way DTSTART is zone-aware, so `UNTIL` is rewritten to UTC.
fn build_rrule_string(master: &CalendarEvent, rule: &str, tzid: Option<&str>) -> String {
    let zone = tzid
        .filter(|_| !master.is_all_day)
        .and_then(|t| t.parse::<Tz>().ok().map(|tz| (t, tz)));

    let dtstart = match zone {
        Some((name, tz)) => format!(
            "DTSTART;TZID={}:{}",
            name,
            master.start.with_timezone(&tz).format("%Y%m%dT%H%M%S")
        ),
        None => format!("DTSTART:{}", master.start.format("%Y%m%dT%H%M%SZ")),
    };

    let rule = rule
        .split(';')
        .map(|part| match part.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("UNTIL") => {
                match utc_until(value, zone.map(|(_, tz)| tz)) {
                    Some(until) => format!("UNTIL={until}"),
                    None => part.to_string(),
                }
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";");

    format!("{dtstart}\nRRULE:{rule}")
}

/// A date-form or floating `UNTIL` value as a UTC date-time.
///
/// A bare date covers the whole named day. Floating values are read in the
/// master's zone when it has one, otherwise as UTC. `None` leaves the value
/// untouched (already UTC, or unparseable and left for rrule to reject).
fn utc_until(value: &str, zone: Option<Tz>) -> Option<String> {
    if value.ends_with(|c: char| c.eq_ignore_ascii_case(&'Z')) {
        return None;
    }
    let local = match NaiveDate::parse_from_str(value, "%Y%m%d") {
        Ok(date) => date.and_hms_opt(23, 59, 59)?,
        Err(_) => NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?,
    };
    let utc = zone
        .and_then(|tz| tz.from_local_datetime(&local).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&local));
    Some(utc.format("%Y%m%dT%H%M%SZ").to_string())
}

/// Expand `master` into instances starting inside `[range_start, range_end]`.
///
/// - Occurrences listed in the master's EXDATEs are dropped.
/// - Occurrences whose key is in `overrides` are dropped; the override event
///   is kept by the caller as its own entry.
/// - The master itself is not returned.
pub fn expand_recurring(
    master: &CalendarEvent,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    overrides: &HashSet<EventKey>,
    limit: u16,
) -> Result<Vec<CalendarEvent>, ExpandError> {
    let recurrence = match &master.recurrence {
        Some(r) => r,
        None => return Ok(Vec::new()),
    };

    let rrule_str = build_rrule_string(master, &recurrence.rule, recurrence.tzid.as_deref());
    let rrule_set: RRuleSet = rrule_str.parse().map_err(|e: rrule::RRuleError| {
        ExpandError::InvalidRule {
            uid: master.id.clone(),
            reason: e.to_string(),
        }
    })?;

    // after/before are exclusive; widen by a second to make the range inclusive
    let tz: rrule::Tz = Utc.into();
    let after = (range_start - Duration::seconds(1)).with_timezone(&tz);
    let before = (range_end + Duration::seconds(1)).with_timezone(&tz);
    let result = rrule_set.after(after).before(before).all(limit);

    if result.limited {
        tracing::debug!(uid = %master.id, limit = limit, "Recurrence expansion hit instance limit");
    }

    let duration = master.end - master.start;
    let exdates: HashSet<DateTime<Utc>> = recurrence.exdates.iter().copied().collect();

    let instances = result
        .dates
        .iter()
        .map(|occurrence| occurrence.with_timezone(&Utc))
        .filter(|start| !exdates.contains(start))
        .filter_map(|start| {
            let rid = instance_id(start, master.is_all_day);
            let key = EventKey {
                id: master.id.clone(),
                recurrence_instance: Some(rid.clone()),
            };
            if overrides.contains(&key) {
                return None;
            }

            let mut instance = master.clone();
            instance.recurrence_instance_id = Some(rid);
            instance.start = start;
            instance.end = start + duration;
            instance.recurrence = None;
            instance.is_recurring = true;
            Some(instance)
        })
        .collect();

    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Recurrence;

    fn range() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap(),
        )
    }

    fn weekly_master(exdates: Vec<DateTime<Utc>>) -> CalendarEvent {
        CalendarEvent::new(
            "weekly",
            "1:1",
            Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 10, 30, 0).unwrap(),
        )
        .with_recurrence(Recurrence {
            rule: "FREQ=WEEKLY;BYDAY=MO".into(),
            exdates,
            tzid: None,
        })
    }

    #[test]
    fn test_weekly_expansion_in_range() {
        let (start, end) = range();
        let instances =
            expand_recurring(&weekly_master(vec![]), start, end, &HashSet::new(), 100).unwrap();

        // Mondays in March 2025 from the 3rd: 3, 10, 17, 24, 31 (31st is past range end at 00:00)
        assert_eq!(instances.len(), 4);
        assert!(instances.iter().all(|e| e.end - e.start == Duration::minutes(30)));
        assert!(instances.iter().all(|e| e.recurrence.is_none() && e.is_recurring));
        assert_eq!(
            instances[1].recurrence_instance_id.as_deref(),
            Some("20250310T100000Z")
        );
    }

    #[test]
    fn test_exdates_removed() {
        let (start, end) = range();
        let ex = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap();
        let instances =
            expand_recurring(&weekly_master(vec![ex]), start, end, &HashSet::new(), 100).unwrap();
        assert_eq!(instances.len(), 3);
        assert!(instances.iter().all(|e| e.start != ex));
    }

    #[test]
    fn test_overridden_occurrence_skipped() {
        let (start, end) = range();
        let mut overrides = HashSet::new();
        overrides.insert(EventKey {
            id: "weekly".into(),
            recurrence_instance: Some("20250317T100000Z".into()),
        });
        let instances =
            expand_recurring(&weekly_master(vec![]), start, end, &overrides, 100).unwrap();
        assert_eq!(instances.len(), 3);
    }

    #[test]
    fn test_all_day_daily_series() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 28).unwrap();
        let master = CalendarEvent::all_day("daily", "Sprint", date, 1).with_recurrence(Recurrence {
            rule: "FREQ=DAILY;COUNT=10".into(),
            exdates: Vec::new(),
            tzid: None,
        });
        let (start, end) = range();
        let instances = expand_recurring(&master, start, end, &HashSet::new(), 100).unwrap();

        // 28, 29, 30 and 31 at midnight (range end is inclusive)
        assert_eq!(instances.len(), 4);
        assert_eq!(instances[0].recurrence_instance_id.as_deref(), Some("20250328"));
        assert!(instances.iter().all(|e| e.is_all_day));
    }

    #[test]
    fn test_all_day_series_with_date_until() {
        let date = NaiveDate::from_ymd_opt(2025, 3, 17).unwrap();
        let master = CalendarEvent::all_day("daily", "Offsite", date, 1).with_recurrence(Recurrence {
            rule: "FREQ=DAILY;UNTIL=20250325".into(),
            exdates: Vec::new(),
            tzid: None,
        });
        let (start, end) = range();
        let instances = expand_recurring(&master, start, end, &HashSet::new(), 100).unwrap();

        // 17th through 25th inclusive
        assert_eq!(instances.len(), 9);
        assert_eq!(instances[0].recurrence_instance_id.as_deref(), Some("20250317"));
        assert_eq!(instances[8].recurrence_instance_id.as_deref(), Some("20250325"));
    }

    #[test]
    fn test_zoned_series_with_date_until_includes_last_day() {
        let master = CalendarEvent::new(
            "ny",
            "Sync",
            Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap(),
        )
        .with_recurrence(Recurrence {
            rule: "FREQ=WEEKLY;UNTIL=20250317".into(),
            exdates: Vec::new(),
            tzid: Some("America/New_York".into()),
        });
        let (start, end) = range();
        let instances = expand_recurring(&master, start, end, &HashSet::new(), 100).unwrap();
        assert_eq!(instances.len(), 3);
    }

    #[test]
    fn test_until_rewritten_to_utc() {
        assert_eq!(utc_until("20250325", None).as_deref(), Some("20250325T235959Z"));
        assert_eq!(utc_until("20250325T120000", None).as_deref(), Some("20250325T120000Z"));
        // 23:59:59 EDT
        assert_eq!(
            utc_until("20250325", Some(chrono_tz::America::New_York)).as_deref(),
            Some("20250326T035959Z")
        );
        assert_eq!(utc_until("20250325T120000Z", None), None);
    }

    #[test]
    fn test_zoned_series_keeps_local_time_across_dst() {
        let master = CalendarEvent::new(
            "ny",
            "Sync",
            // 09:00 EST
            Utc.with_ymd_and_hms(2025, 3, 3, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap(),
        )
        .with_recurrence(Recurrence {
            rule: "FREQ=WEEKLY;COUNT=3".into(),
            exdates: Vec::new(),
            tzid: Some("America/New_York".into()),
        });
        let (start, end) = range();
        let instances = expand_recurring(&master, start, end, &HashSet::new(), 100).unwrap();

        assert_eq!(instances.len(), 3);
        // 2025-03-17 is after the DST switch: 09:00 EDT is 13:00 UTC
        assert_eq!(instances[2].start, Utc.with_ymd_and_hms(2025, 3, 17, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_invalid_rule() {
        let mut master = weekly_master(vec![]);
        if let Some(r) = master.recurrence.as_mut() {
            r.rule = "NOT A RULE".into();
        }
        let (start, end) = range();
        let err = expand_recurring(&master, start, end, &HashSet::new(), 100).unwrap_err();
        assert!(err.to_string().contains("weekly"));
    }
}
