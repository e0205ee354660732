//! Calendar ingestion and caching.
//!
//! Fetches remote iCalendar feeds, expands and cleans their events, and keeps
//! a small in-memory window of upcoming events that readers can snapshot
//! without touching the network.

pub mod config;
pub mod event;
pub mod feed;
pub mod health;
pub mod pipeline;
pub mod refresh;
pub mod skip;
pub mod storage;
pub mod util;
