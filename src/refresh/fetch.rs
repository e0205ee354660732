use crate::config::{Config, ConfigError, SourceConfig};
use crate::event::CalendarEvent;
use crate::feed::{CalendarParser, FetchError, Transport};
use crate::health::HealthSink;
use crate::pipeline::{source_pipeline, ProcessingContext, SourcePipeline};
use crate::storage::{fingerprint, SourceChangeCache};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Knobs for one fetch fan-out.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Simultaneous source fetches (kept small for constrained hardware)
    pub concurrency: usize,
    /// Wall-clock ceiling for the whole fan-out
    pub cycle_timeout: Duration,
    /// Fallback data older than this is still served, but logged as stale
    pub staleness_ceiling: chrono::Duration,
    pub expansion_days: u32,
    pub timezone: Tz,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            cycle_timeout: Duration::from_secs(120),
            staleness_ceiling: chrono::Duration::minutes(60),
            expansion_days: 14,
            timezone: Tz::UTC,
        }
    }
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            concurrency: config.fetch_concurrency(),
            cycle_timeout: config.cycle_timeout(),
            staleness_ceiling: config.staleness_ceiling(),
            expansion_days: config.expansion_days,
            timezone: config.tz()?,
        })
    }
}

/// Last-known-good events served for a source whose fetch failed,
/// re-expanded against the current cycle.
#[derive(Debug, Clone)]
pub struct Fallback {
    pub events: Arc<Vec<CalendarEvent>>,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub enum SourceOutcome {
    /// Content changed (or was never seen) and parsed cleanly
    Fresh {
        events: Arc<Vec<CalendarEvent>>,
        warnings: Vec<String>,
    },
    /// Fingerprint matched the cache; parsing skipped, cached parse
    /// re-expanded for this cycle
    Unchanged { events: Arc<Vec<CalendarEvent>> },
    /// Fetch or pipeline failed, with cached events when there are any
    Failed {
        error: String,
        fallback: Option<Fallback>,
    },
}

impl SourceOutcome {
    /// Events this source contributes to the cycle, if any.
    pub fn events(&self) -> Option<&Arc<Vec<CalendarEvent>>> {
        match self {
            SourceOutcome::Fresh { events, .. } | SourceOutcome::Unchanged { events } => Some(events),
            SourceOutcome::Failed { fallback, .. } => fallback.as_ref().map(|f| &f.events),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SourceOutcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Fresh { .. } => "fresh",
            SourceOutcome::Unchanged { .. } => "unchanged",
            SourceOutcome::Failed { fallback: Some(_), .. } => "failed_with_fallback",
            SourceOutcome::Failed { fallback: None, .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: SourceOutcome,
}

/// Runs the per-source pipeline for every source under a concurrency gate.
///
/// Only this type writes to the [`SourceChangeCache`]. The cache holds
/// parse output, before recurrence expansion, so reused entries follow the
/// expansion horizon as time moves on.
pub struct FetchOrchestrator<T> {
    transport: T,
    pipeline: SourcePipeline,
    cache: Arc<SourceChangeCache>,
    health: Arc<dyn HealthSink>,
    settings: FetchSettings,
}

impl<T: Transport> FetchOrchestrator<T> {
    pub fn new(
        transport: T,
        parser: Arc<dyn CalendarParser>,
        cache: Arc<SourceChangeCache>,
        health: Arc<dyn HealthSink>,
        settings: FetchSettings,
    ) -> Self {
        Self {
            transport,
            pipeline: source_pipeline(parser),
            cache,
            health,
            settings,
        }
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetch every source, returning one report per source in input order.
    ///
    /// All sources share one deadline `cycle_timeout` from now. A source
    /// still fetching (or not yet started) when it passes is a failure for
    /// this cycle; siblings are never aborted by one source failing.
    pub async fn fetch_all<'a>(&'a self, sources: &'a [SourceConfig], now: DateTime<Utc>) -> Vec<SourceReport> {
        if sources.is_empty() {
            return Vec::new();
        }

        let deadline = Instant::now() + self.settings.cycle_timeout;
        let mut fetches: Vec<BoxFuture<'a, (usize, SourceReport)>> = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            fetches.push(async move { (index, self.fetch_source(source, now, deadline).await) }.boxed());
        }
        let mut reports: Vec<(usize, SourceReport)> = stream::iter(fetches)
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Fetch one source and classify the outcome.
    pub async fn fetch_source(
        &self,
        source: &SourceConfig,
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> SourceReport {
        let raw = match tokio::time::timeout_at(deadline, self.transport.fetch(source)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => return self.failed(source, e.to_string(), now),
            Err(_) => return self.failed(source, FetchError::Timeout.to_string(), now),
        };

        let fp = fingerprint(&raw);
        if let Some(entry) = self.cache.lookup(&source.id) {
            if entry.fingerprint == fp && self.cache.touch_on_fingerprint_match(&source.id, now) {
                let (events, _) = match self.normalize(&entry.events, now) {
                    Ok(normalized) => normalized,
                    Err(error) => return self.failed(source, error, now),
                };
                tracing::debug!(source = %source.id, events = events.len(), "Feed unchanged, skipping parse");
                self.health.source_succeeded(&source.id, now);
                return SourceReport {
                    source_id: source.id.clone(),
                    outcome: SourceOutcome::Unchanged {
                        events: Arc::new(events),
                    },
                };
            }
        }

        let ctx = ProcessingContext::for_source(raw, now).with_timezone(self.settings.timezone);
        let parsed = self.pipeline.parse.run(ctx);
        if !parsed.success {
            return self.failed(source, parsed.errors.join("; "), now);
        }

        let parsed_events = Arc::new(parsed.events);
        let (events, expand_warnings) = match self.normalize(&parsed_events, now) {
            Ok(normalized) => normalized,
            Err(error) => return self.failed(source, error, now),
        };
        let mut warnings = parsed.warnings;
        warnings.extend(expand_warnings);
        for warning in &warnings {
            tracing::debug!(source = %source.id, warning = %warning, "Feed warning");
        }

        self.cache.record_success(&source.id, fp, parsed_events, now);
        self.health.source_succeeded(&source.id, now);
        tracing::debug!(
            source = %source.id,
            events = events.len(),
            warnings = warnings.len(),
            "Feed parsed"
        );

        SourceReport {
            source_id: source.id.clone(),
            outcome: SourceOutcome::Fresh {
                events: Arc::new(events),
                warnings,
            },
        }
    }

    /// Expand, deduplicate and sort parse output against `now`.
    fn normalize(
        &self,
        parsed: &[CalendarEvent],
        now: DateTime<Utc>,
    ) -> Result<(Vec<CalendarEvent>, Vec<String>), String> {
        let ctx = ProcessingContext::for_events(parsed.to_vec(), now)
            .with_timezone(self.settings.timezone)
            .with_expansion_days(self.settings.expansion_days);
        let result = self.pipeline.normalize.run(ctx);
        if !result.success {
            return Err(result.errors.join("; "));
        }
        Ok((result.events, result.warnings))
    }

    fn failed(&self, source: &SourceConfig, error: String, now: DateTime<Utc>) -> SourceReport {
        self.health.source_failed(&source.id, now, &error);

        let Some(consecutive_failures) = self.cache.record_failure(&source.id) else {
            tracing::warn!(source = %source.id, error = %error, "Source refresh failed, nothing cached");
            return SourceReport {
                source_id: source.id.clone(),
                outcome: SourceOutcome::Failed {
                    error,
                    fallback: None,
                },
            };
        };

        let fallback = self.cache.lookup(&source.id).map(|entry| {
            let age = now - entry.last_success;
            let stale = age > self.settings.staleness_ceiling;
            if stale {
                tracing::warn!(
                    source = %source.id,
                    last_success = %entry.last_success,
                    age_minutes = age.num_minutes(),
                    "Serving stale fallback events"
                );
            }
            let events = match self.normalize(&entry.events, now) {
                Ok((events, _)) => Arc::new(events),
                Err(e) => {
                    tracing::warn!(source = %source.id, error = %e, "Serving cached events unexpanded");
                    entry.events
                }
            };
            Fallback { events, stale }
        });

        tracing::warn!(
            source = %source.id,
            error = %error,
            consecutive_failures = consecutive_failures,
            fallback_events = fallback.as_ref().map_or(0, |f| f.events.len()),
            "Source refresh failed"
        );

        SourceReport {
            source_id: source.id.clone(),
            outcome: SourceOutcome::Failed { error, fallback },
        }
    }
}
