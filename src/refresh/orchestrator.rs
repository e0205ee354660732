use super::fetch::{FetchOrchestrator, SourceOutcome, SourceReport};
use crate::config::{Config, ConfigError, SourceConfig};
use crate::event::CalendarEvent;
use crate::feed::Transport;
use crate::health::HealthSink;
use crate::pipeline::{post_pipeline, Pipeline, ProcessingContext};
use crate::skip::SkipProvider;
use crate::storage::EventWindow;
use crate::util::catch_task_panic;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub interval: Duration,
    /// Window start is `now - lookback`, so earlier-today events stay visible
    pub lookback: chrono::Duration,
    pub max_events: usize,
    pub timezone: Tz,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            lookback: chrono::Duration::hours(24),
            max_events: 50,
            timezone: Tz::UTC,
        }
    }
}

impl RefreshSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            interval: config.refresh_interval(),
            lookback: config.lookback(),
            max_events: config.max_events,
            timezone: config.tz()?,
        })
    }
}

/// Where the current cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Fetching,
    PostProcessing,
    Publishing,
    /// Every source failed with no cached events to fall back on; window
    /// left as is
    Preserving,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Published {
        events: usize,
        fresh: usize,
        unchanged: usize,
        failed: usize,
    },
    Preserved {
        failed: usize,
    },
    /// Post-processing failed or the cycle panicked; window left as is
    Failed {
        reason: String,
    },
}

/// Ties fetching, post-processing and publication together on an interval.
pub struct RefreshOrchestrator<T> {
    fetcher: FetchOrchestrator<T>,
    sources: Vec<SourceConfig>,
    post: Pipeline,
    window: Arc<EventWindow>,
    skip: Arc<dyn SkipProvider>,
    health: Arc<dyn HealthSink>,
    settings: RefreshSettings,
    state: Mutex<RefreshState>,
}

impl<T: Transport + 'static> RefreshOrchestrator<T> {
    pub fn new(
        fetcher: FetchOrchestrator<T>,
        sources: Vec<SourceConfig>,
        window: Arc<EventWindow>,
        skip: Arc<dyn SkipProvider>,
        health: Arc<dyn HealthSink>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            fetcher,
            sources,
            post: post_pipeline(),
            window,
            skip,
            health,
            settings,
            state: Mutex::new(RefreshState::Idle),
        }
    }

    pub fn window(&self) -> Arc<EventWindow> {
        Arc::clone(&self.window)
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: RefreshState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "Refresh state");
            *state = next;
        }
    }

    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(Utc::now()).await
    }

    /// One full cycle with `now` as the reference time.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleOutcome {
        self.health.refresh_attempted(now);

        self.set_state(RefreshState::Fetching);
        let reports = self.fetcher.fetch_all(&self.sources, now).await;
        let (fresh, unchanged, failed) = tally(&reports);

        if !has_usable_data(&reports) {
            self.set_state(RefreshState::Preserving);
            tracing::warn!(
                sources = self.sources.len(),
                kept_events = self.window.snapshot().len(),
                "All sources failed, keeping previous window"
            );
            self.set_state(RefreshState::Idle);
            return CycleOutcome::Preserved { failed };
        }

        self.set_state(RefreshState::PostProcessing);
        let mut union: Vec<CalendarEvent> = reports
            .iter()
            .filter_map(|r| r.outcome.events())
            .flat_map(|events| events.iter().cloned())
            .collect();
        // Each source is sorted on its own; the limit needs the union sorted
        union.sort_by_key(|e| e.start);

        let ctx = ProcessingContext::for_events(union, now)
            .with_timezone(self.settings.timezone)
            .with_window(Some(now - self.settings.lookback), None)
            .with_max_events(self.settings.max_events)
            .with_skipped(self.skipped_ids());
        let result = self.post.run(ctx);
        if !result.success {
            let reason = result.errors.join("; ");
            tracing::error!(error = %reason, "Post-processing failed, keeping previous window");
            self.set_state(RefreshState::Idle);
            return CycleOutcome::Failed { reason };
        }

        self.set_state(RefreshState::Publishing);
        let events = result.events.len();
        self.window.publish(result.events, now);
        self.health.refresh_succeeded(now, events);
        tracing::info!(
            events = events,
            fresh = fresh,
            unchanged = unchanged,
            failed = failed,
            filtered = result.events_filtered,
            feed_warnings = feed_warnings(&reports),
            "Published event window"
        );

        self.set_state(RefreshState::Idle);
        CycleOutcome::Published {
            events,
            fresh,
            unchanged,
            failed,
        }
    }

    /// A failing provider means nothing is skipped this cycle.
    fn skipped_ids(&self) -> HashSet<String> {
        self.skip.skipped_ids().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Skip list unavailable, skipping nothing");
            HashSet::new()
        })
    }

    /// Refresh immediately, then every `interval`, until `stop` flips to
    /// `true` or its sender is dropped.
    ///
    /// A stop request cancels the in-flight cycle. Publication is a single
    /// swap, so cancelling never leaves a partial window.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }
            if *stop.borrow() {
                break;
            }

            self.health.heartbeat(Utc::now());

            tokio::select! {
                biased;
                _ = stop.changed() => {
                    tracing::info!("Stop requested, cancelling in-flight refresh");
                    break;
                }
                result = catch_task_panic(self.run_cycle()) => match result {
                    Ok(outcome) => tracing::debug!(outcome = ?outcome, "Refresh cycle finished"),
                    Err(panic) => {
                        tracing::error!(error = %panic, "Refresh cycle panicked");
                        self.set_state(RefreshState::Idle);
                    }
                },
            }
        }

        self.set_state(RefreshState::Idle);
        tracing::info!("Refresh loop stopped");
    }

    /// Start the loop on the runtime.
    pub fn spawn(self: Arc<Self>) -> RefreshHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(stop_rx).await });
        RefreshHandle { stop_tx, task }
    }
}

/// Whether the cycle has anything worth publishing.
///
/// A source that succeeded counts even with zero events: its calendar is
/// genuinely empty. When every source failed, an empty fallback does not
/// count, so the previous window is kept instead of being blanked.
fn has_usable_data(reports: &[SourceReport]) -> bool {
    if reports.iter().all(|r| r.outcome.is_failed()) {
        reports
            .iter()
            .any(|r| r.outcome.events().is_some_and(|events| !events.is_empty()))
    } else {
        true
    }
}

/// Parser and expansion warnings from sources parsed this cycle.
fn feed_warnings(reports: &[SourceReport]) -> usize {
    reports
        .iter()
        .map(|r| match &r.outcome {
            SourceOutcome::Fresh { warnings, .. } => warnings.len(),
            _ => 0,
        })
        .sum()
}

fn tally(reports: &[SourceReport]) -> (usize, usize, usize) {
    reports
        .iter()
        .fold((0, 0, 0), |(fresh, unchanged, failed), r| match r.outcome {
            SourceOutcome::Fresh { .. } => (fresh + 1, unchanged, failed),
            SourceOutcome::Unchanged { .. } => (fresh, unchanged + 1, failed),
            SourceOutcome::Failed { .. } => (fresh, unchanged, failed + 1),
        })
}

/// Owner of a spawned refresh loop.
pub struct RefreshHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(self) {
        // Err only if the loop already exited and dropped its receiver
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Refresh task ended abnormally");
        }
    }
}
