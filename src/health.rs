//! Health reporting for the refresh loop.
//!
//! The refresh loop reports into a [`HealthSink`] on a best-effort basis:
//! sink methods return nothing and must not fail the caller, so telemetry
//! problems can never affect what ends up in the window.
//!
//! [`HealthTracker`] is the in-process sink. It keeps the latest timestamps
//! and per-source status so a liveness probe or status endpoint can ask
//! whether the background task is still cycling.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

pub trait HealthSink: Send + Sync {
    fn refresh_attempted(&self, at: DateTime<Utc>);
    fn refresh_succeeded(&self, at: DateTime<Utc>, event_count: usize);
    fn source_succeeded(&self, source_id: &str, at: DateTime<Utc>);
    fn source_failed(&self, source_id: &str, at: DateTime<Utc>, reason: &str);
    fn heartbeat(&self, at: DateTime<Utc>);
}

/// Status of one source as last reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl SourceHealth {
    pub fn is_failing(&self) -> bool {
        self.consecutive_failures > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub last_refresh_attempt: Option<DateTime<Utc>>,
    pub last_refresh_success: Option<DateTime<Utc>>,
    pub last_event_count: Option<usize>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub sources: HashMap<String, SourceHealth>,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    state: RwLock<HealthReport>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> HealthReport {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live while the background task has sent a heartbeat within `max_silence`.
    pub fn is_live(&self, now: DateTime<Utc>, max_silence: Duration) -> bool {
        self.report()
            .last_heartbeat
            .is_some_and(|beat| now - beat <= max_silence)
    }

    fn update(&self, f: impl FnOnce(&mut HealthReport)) {
        match self.state.write() {
            Ok(mut state) => f(&mut state),
            // Readers and writers never leave the report half-updated; log and skip
            Err(_) => tracing::warn!("Poisoned health tracker lock, dropping update"),
        }
    }
}

impl HealthSink for HealthTracker {
    fn refresh_attempted(&self, at: DateTime<Utc>) {
        self.update(|s| s.last_refresh_attempt = Some(at));
    }

    fn refresh_succeeded(&self, at: DateTime<Utc>, event_count: usize) {
        self.update(|s| {
            s.last_refresh_success = Some(at);
            s.last_event_count = Some(event_count);
        });
    }

    fn source_succeeded(&self, source_id: &str, at: DateTime<Utc>) {
        self.update(|s| {
            let source = s.sources.entry(source_id.to_string()).or_default();
            source.last_success = Some(at);
            source.consecutive_failures = 0;
        });
    }

    fn source_failed(&self, source_id: &str, at: DateTime<Utc>, reason: &str) {
        self.update(|s| {
            let source = s.sources.entry(source_id.to_string()).or_default();
            source.last_failure = Some(at);
            source.last_error = Some(reason.to_string());
            source.consecutive_failures = source.consecutive_failures.saturating_add(1);
        });
    }

    fn heartbeat(&self, at: DateTime<Utc>) {
        self.update(|s| s.last_heartbeat = Some(at));
    }
}
