//! Stages that turn one source's raw feed into a clean, time-ordered list.

use super::{Pipeline, ProcessingContext, ProcessingResult, Stage};
use crate::event::{CalendarEvent, EventKey};
use crate::feed::CalendarParser;
use chrono::Duration;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// The per-source stages, split where the source cache sits.
///
/// `parse` output is what the cache keeps. `normalize` depends on the
/// current time through the recurrence horizon, so it runs every cycle,
/// including when a cached parse is reused.
pub struct SourcePipeline {
    /// Parse
    pub parse: Pipeline,
    /// Expand recurrences → Deduplicate → Sort
    pub normalize: Pipeline,
}

pub fn source_pipeline(parser: Arc<dyn CalendarParser>) -> SourcePipeline {
    SourcePipeline {
        parse: Pipeline::new().with_stage(ParseStage::new(parser.clone())),
        normalize: Pipeline::new()
            .with_stage(ExpandRecurrencesStage::new(parser))
            .with_stage(DeduplicateStage)
            .with_stage(SortStage),
    }
}

/// Raw bytes to events. A parser failure stops the pipeline; nothing from
/// a malformed feed is kept.
pub struct ParseStage {
    parser: Arc<dyn CalendarParser>,
}

impl ParseStage {
    pub fn new(parser: Arc<dyn CalendarParser>) -> Self {
        Self { parser }
    }
}

impl Stage for ParseStage {
    fn name(&self) -> &str {
        "parse"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let Some(raw) = ctx.raw_content.as_deref() else {
            return ProcessingResult::failed("No raw content to parse");
        };

        let parsed = match self.parser.parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => return ProcessingResult::failed(format!("Parse failed: {e}")),
        };

        if let Some(name) = parsed.calendar_name {
            ctx.extras.insert("calendar_name".into(), json!(name));
        }
        if let Some(tz) = parsed.timezone {
            ctx.extras.insert("calendar_timezone".into(), json!(tz));
        }

        ctx.events = parsed.events;
        let mut result = ProcessingResult::counted(0, ctx.events.len());
        result.warnings = parsed.warnings;
        result
    }
}

/// Recurring masters to dated instances within
/// `[now - 1 day, now + expansion_days]`.
pub struct ExpandRecurrencesStage {
    parser: Arc<dyn CalendarParser>,
}

impl ExpandRecurrencesStage {
    pub fn new(parser: Arc<dyn CalendarParser>) -> Self {
        Self { parser }
    }
}

impl Stage for ExpandRecurrencesStage {
    fn name(&self) -> &str {
        "expand_recurrences"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let events_in = ctx.events.len();
        if !ctx.events.iter().any(CalendarEvent::is_recurring_master) {
            return ProcessingResult::counted(events_in, events_in);
        }

        let Some(expander) = self.parser.expander() else {
            return ProcessingResult::counted(events_in, events_in)
                .with_warning("Recurrence expansion unavailable, passing recurring events through");
        };

        let range_start = ctx.now - Duration::days(1);
        let range_end = ctx.now + Duration::days(i64::from(ctx.expansion_days));
        let expansion = expander.expand(std::mem::take(&mut ctx.events), range_start, range_end);
        ctx.events = expansion.events;

        let mut result = ProcessingResult::counted(events_in, ctx.events.len());
        // Masters are replaced by their instances, which is not filtering
        result.events_filtered = 0;
        result.warnings = expansion.warnings;
        result
    }
}

/// Removes repeats by composite key, keeping the richer duplicate.
///
/// Single pass over a hash map of key to position in the output, so the
/// cost is linear in the number of events. Ties keep the first seen, and
/// output order is first-seen order.
pub struct DeduplicateStage;

impl Stage for DeduplicateStage {
    fn name(&self) -> &str {
        "deduplicate"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        let events_in = ctx.events.len();
        let mut positions: HashMap<EventKey, usize> = HashMap::with_capacity(events_in);
        let mut kept: Vec<CalendarEvent> = Vec::with_capacity(events_in);

        for event in ctx.events.drain(..) {
            match positions.get(&event.key()) {
                Some(&index) => {
                    if event.information_score() > kept[index].information_score() {
                        kept[index] = event;
                    }
                }
                None => {
                    positions.insert(event.key(), kept.len());
                    kept.push(event);
                }
            }
        }

        ctx.events = kept;
        ProcessingResult::counted(events_in, ctx.events.len())
    }
}

/// Stable sort by start time.
pub struct SortStage;

impl Stage for SortStage {
    fn name(&self) -> &str {
        "sort"
    }

    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult {
        ctx.events.sort_by_key(|e| e.start);
        ProcessingResult::counted(ctx.events.len(), ctx.events.len())
    }
}
