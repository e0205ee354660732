//! In-memory state owned by the refresh loop.
//!
//! - [`SourceChangeCache`]: per-source fingerprint, last-good events and
//!   failure counter, used to skip re-parsing and to serve fallback data
//! - [`EventWindow`]: the published snapshot readers see
//!
//! Both live for the lifetime of the process and are rebuilt on restart.

mod source_cache;
mod window;

pub use source_cache::{
    fingerprint, Fingerprint, SourceCacheEntry, SourceChangeCache, DEFAULT_CAPACITY,
};
pub use window::{EventWindow, WindowSnapshot};
