//! The background refresh loop.
//!
//! [`FetchOrchestrator`] fans out over the configured sources with bounded
//! concurrency, classifying each as fresh, unchanged or failed and falling
//! back to cached events on failure. [`RefreshOrchestrator`] runs that on an
//! interval, post-processes the union and publishes the [`EventWindow`],
//! unless every source failed with no cached events to fall back on.
//!
//! [`EventWindow`]: crate::storage::EventWindow

mod fetch;
mod orchestrator;

pub use fetch::{Fallback, FetchOrchestrator, FetchSettings, SourceOutcome, SourceReport};
pub use orchestrator::{
    CycleOutcome, RefreshHandle, RefreshOrchestrator, RefreshSettings, RefreshState,
};
