use crate::event::CalendarEvent;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default number of sources remembered (single-user deployment)
pub const DEFAULT_CAPACITY: usize = 10;

/// Property names whose value changes on every export of unchanged data.
const VOLATILE_PROPERTIES: &[&str] = &["DTSTAMP"];

/// Normalized SHA-256 of a feed body, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash feed content with generation-timestamp lines removed.
///
/// Two exports of logically identical data differ only in `DTSTAMP`, so
/// those lines are dropped before hashing. Line endings are normalized so a
/// CRLF/LF difference alone does not count as a change.
pub fn fingerprint(content: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();

    for line in content.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if is_volatile_line(line) {
            continue;
        }
        hasher.update(line);
        hasher.update(b"\n");
    }

    Fingerprint(format!("{:x}", hasher.finalize()))
}

/// `DTSTAMP:...` or `DTSTAMP;params:...`, case-insensitive on the name.
fn is_volatile_line(line: &[u8]) -> bool {
    VOLATILE_PROPERTIES.iter().any(|name| {
        let name = name.as_bytes();
        line.len() > name.len()
            && line[..name.len()].eq_ignore_ascii_case(name)
            && matches!(line[name.len()], b':' | b';')
    })
}

/// Last known good state of one source.
#[derive(Debug, Clone)]
pub struct SourceCacheEntry {
    pub fingerprint: Fingerprint,
    pub last_success: DateTime<Utc>,
    /// Events as parsed on the last fresh fetch, before recurrence
    /// expansion (shared, never mutated)
    pub events: Arc<Vec<CalendarEvent>>,
    pub consecutive_failures: u32,
}

/// Per-source change-detection store.
///
/// Mutated concurrently by the per-source fetch tasks, so every operation
/// takes the internal lock for the duration of a map access only.
#[derive(Debug)]
pub struct SourceChangeCache {
    capacity: usize,
    entries: Mutex<HashMap<String, SourceCacheEntry>>,
}

impl Default for SourceChangeCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SourceChangeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// A poisoned lock only means a fetch task panicked mid-access; the map
    /// itself is never left half-written, so keep serving it.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SourceCacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, source_id: &str) -> Option<SourceCacheEntry> {
        self.lock().get(source_id).cloned()
    }

    /// Store the result of a fresh parse, evicting the entry with the oldest
    /// last-success timestamp first when the store is full.
    pub fn record_success(
        &self,
        source_id: &str,
        fingerprint: Fingerprint,
        events: Arc<Vec<CalendarEvent>>,
        at: DateTime<Utc>,
    ) {
        let mut entries = self.lock();

        if !entries.contains_key(source_id) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_success)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                tracing::debug!(
                    evicted = %oldest,
                    capacity = self.capacity,
                    "Source cache full, evicted oldest entry"
                );
            }
        }

        entries.insert(
            source_id.to_string(),
            SourceCacheEntry {
                fingerprint,
                last_success: at,
                events,
                consecutive_failures: 0,
            },
        );
    }

    /// Fast path for an unchanged feed: refresh the timestamp and clear the
    /// failure counter, leaving the stored events alone.
    ///
    /// Returns `false` when the source has no entry.
    pub fn touch_on_fingerprint_match(&self, source_id: &str, at: DateTime<Utc>) -> bool {
        match self.lock().get_mut(source_id) {
            Some(entry) => {
                entry.last_success = at;
                entry.consecutive_failures = 0;
                true
            }
            None => false,
        }
    }

    /// Count a failed fetch against an existing entry.
    ///
    /// Returns the new consecutive failure count, or `None` when the source
    /// has never succeeded (nothing is created on failure).
    pub fn record_failure(&self, source_id: &str) -> Option<u32> {
        self.lock().get_mut(source_id).map(|entry| {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
            entry.consecutive_failures
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    const FEED: &str = "BEGIN:VCALENDAR\r\nDTSTAMP:20250101T000000Z\r\nBEGIN:VEVENT\r\nUID:1\r\nDTSTAMP:20250101T000000Z\r\nSUMMARY:Standup\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn events(n: usize) -> Arc<Vec<CalendarEvent>> {
        Arc::new(
            (0..n)
                .map(|i| CalendarEvent::new(format!("e{i}"), "Event", t0(), t0()))
                .collect(),
        )
    }

    #[test]
    fn test_fingerprint_ignores_dtstamp() {
        let other = FEED.replace("20250101T000000Z", "20250607T123456Z");
        assert_eq!(fingerprint(FEED.as_bytes()), fingerprint(other.as_bytes()));
    }

    #[test]
    fn test_fingerprint_ignores_dtstamp_with_params() {
        let a = "SUMMARY:x\nDTSTAMP;VALUE=DATE-TIME:20250101T000000Z\n";
        let b = "SUMMARY:x\nDTSTAMP;VALUE=DATE-TIME:20260101T000000Z\n";
        assert_eq!(fingerprint(a.as_bytes()), fingerprint(b.as_bytes()));
    }

    #[test]
    fn test_fingerprint_detects_summary_change() {
        let other = FEED.replace("Standup", "Retro");
        assert_ne!(fingerprint(FEED.as_bytes()), fingerprint(other.as_bytes()));
    }

    #[test]
    fn test_fingerprint_does_not_strip_lookalike_properties() {
        let a = "DTSTAMPX:1\n";
        let b = "DTSTAMPX:2\n";
        assert_ne!(fingerprint(a.as_bytes()), fingerprint(b.as_bytes()));
    }

    #[test]
    fn test_fingerprint_line_endings_normalized() {
        let lf = FEED.replace("\r\n", "\n");
        assert_eq!(fingerprint(FEED.as_bytes()), fingerprint(lf.as_bytes()));
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_record_and_lookup() {
        let cache = SourceChangeCache::default();
        assert!(cache.lookup("a").is_none());

        cache.record_success("a", fingerprint(b"x"), events(2), t0());
        let entry = cache.lookup("a").unwrap();
        assert_eq!(entry.events.len(), 2);
        assert_eq!(entry.last_success, t0());
        assert_eq!(entry.consecutive_failures, 0);
    }

    #[test]
    fn test_touch_keeps_events_and_resets_failures() {
        let cache = SourceChangeCache::default();
        cache.record_success("a", fingerprint(b"x"), events(3), t0());
        assert_eq!(cache.record_failure("a"), Some(1));
        assert_eq!(cache.record_failure("a"), Some(2));

        let later = t0() + Duration::minutes(5);
        assert!(cache.touch_on_fingerprint_match("a", later));

        let entry = cache.lookup("a").unwrap();
        assert_eq!(entry.last_success, later);
        assert_eq!(entry.consecutive_failures, 0);
        assert_eq!(entry.events.len(), 3);
    }

    #[test]
    fn test_touch_unknown_source() {
        let cache = SourceChangeCache::default();
        assert!(!cache.touch_on_fingerprint_match("missing", t0()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_failure_without_entry_creates_nothing() {
        let cache = SourceChangeCache::default();
        assert_eq!(cache.record_failure("a"), None);
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_eviction_removes_oldest_success() {
        let cache = SourceChangeCache::new(10);
        // Insert out of timestamp order so eviction cannot rely on insertion order
        for i in 0..10 {
            let at = t0() + Duration::minutes(((i * 7) % 10) as i64);
            cache.record_success(&format!("s{i}"), fingerprint(b"x"), events(1), at);
        }
        // s0 has offset 0 and is the oldest
        cache.record_success("s10", fingerprint(b"x"), events(1), t0() + Duration::hours(1));

        assert_eq!(cache.len(), 10);
        assert!(cache.lookup("s0").is_none());
        for i in 1..=10 {
            assert!(cache.lookup(&format!("s{i}")).is_some(), "s{i} evicted");
        }
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = SourceChangeCache::new(2);
        cache.record_success("a", fingerprint(b"1"), events(1), t0());
        cache.record_success("b", fingerprint(b"1"), events(1), t0());
        cache.record_success("a", fingerprint(b"2"), events(4), t0() + Duration::minutes(1));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("a").unwrap().events.len(), 4);
        assert!(cache.lookup("b").is_some());
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let cache = SourceChangeCache::new(2);
        cache.record_success("a", fingerprint(b"1"), events(1), t0());
        cache.record_success("b", fingerprint(b"1"), events(1), t0() + Duration::minutes(1));
        cache.touch_on_fingerprint_match("a", t0() + Duration::minutes(2));

        cache.record_success("c", fingerprint(b"1"), events(1), t0() + Duration::minutes(3));
        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_none());
    }
}
