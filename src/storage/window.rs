use crate::event::CalendarEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

/// Immutable view of the published events.
#[derive(Debug, Default, Serialize)]
pub struct WindowSnapshot {
    pub events: Vec<CalendarEvent>,
    /// When the refresh that produced this window completed (`None` before the first publish)
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl WindowSnapshot {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The single published artifact read by consumers.
///
/// Publishing swaps one `Arc` under a write lock held only for the swap, so a
/// reader either holds the previous snapshot or the new one, never a mix.
#[derive(Debug, Default)]
pub struct EventWindow {
    current: RwLock<Arc<WindowSnapshot>>,
}

impl EventWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current window; cheap to call, never blocks on a refresh in progress.
    pub fn snapshot(&self) -> Arc<WindowSnapshot> {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the whole window.
    pub fn publish(&self, events: Vec<CalendarEvent>, refreshed_at: DateTime<Utc>) {
        // Build outside the lock; only the pointer swap is guarded
        let next = Arc::new(WindowSnapshot {
            events,
            refreshed_at: Some(refreshed_at),
        });
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = next;
    }
}
