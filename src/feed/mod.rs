//! Calendar feed retrieval and parsing.
//!
//! - **Fetching**: [`Transport`] and its HTTP implementation with size and
//!   time limits
//! - **Parsing**: [`CalendarParser`] and the iCalendar implementation
//! - **Recurrence**: RRULE expansion behind [`RecurrenceExpander`]
//!
//! The refresh loop only sees the two traits, so tests can swap in
//! in-memory transports and parsers.

mod fetcher;
mod parser;
mod recurrence;

pub use fetcher::{FetchError, HttpTransport, Transport, DEFAULT_MAX_FEED_SIZE};
pub use parser::{
    CalendarParser, ExpandError, Expansion, IcsParser, ParseError, ParsedFeed, RecurrenceExpander,
};
pub use recurrence::{expand_recurring, instance_id, MAX_INSTANCES_PER_SERIES};
