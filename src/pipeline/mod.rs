//! Composable event-processing pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s run strictly one after
//! another over a shared [`ProcessingContext`]:
//!
//! - **Per-source** ([`source_pipeline`]): Parse, then Expand recurrences → Deduplicate → Sort
//! - **Post-processing** ([`post_pipeline`]): Skipped filter → Time window → Limit
//!
//! Stages never fail by panicking or returning `Err`; they report errors in
//! their [`ProcessingResult`], and the pipeline stops at the first stage
//! that does.
//!
//! # Example
//!
//! ```ignore
//! let pipeline = post_pipeline();
//! let ctx = ProcessingContext::for_events(events, Utc::now()).with_max_events(50);
//! let result = pipeline.run(ctx);
//! if result.success {
//!     publish(result.events);
//! }
//! ```

mod context;
pub mod post_stages;
pub mod source_stages;

pub use context::{Metadata, ProcessingContext, ProcessingResult};
pub use post_stages::{post_pipeline, LimitStage, SkippedFilterStage, TimeWindowStage};
pub use source_stages::{
    source_pipeline, DeduplicateStage, ExpandRecurrencesStage, ParseStage, SortStage, SourcePipeline,
};

use crate::util::panic_message;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// One independently testable step of a pipeline.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Read and rewrite `ctx`, reporting counts, warnings and errors.
    fn process(&self, ctx: &mut ProcessingContext) -> ProcessingResult;
}

/// Ordered, sequential, fail-fast list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, consuming the context.
    ///
    /// On success the aggregate carries the final event list and the
    /// context's side-channel data. On the first stage error the run stops
    /// and the aggregate carries no events: a partial list is never trusted.
    pub fn run(&self, mut ctx: ProcessingContext) -> ProcessingResult {
        let mut aggregate = ProcessingResult {
            events_in: ctx.events.len(),
            ..ProcessingResult::default()
        };
        let mut stage_reports = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let result = match catch_unwind(AssertUnwindSafe(|| stage.process(&mut ctx))) {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic);
                    tracing::error!(stage = stage.name(), error = %message, "Stage panicked");
                    ProcessingResult::failed(format!("{} panicked: {}", stage.name(), message))
                }
            };

            tracing::debug!(
                stage = stage.name(),
                events_in = result.events_in,
                events_out = result.events_out,
                filtered = result.events_filtered,
                warnings = result.warnings.len(),
                errors = result.errors.len(),
                "Stage complete"
            );

            stage_reports.push(json!({
                "stage": stage.name(),
                "events_in": result.events_in,
                "events_out": result.events_out,
                "events_filtered": result.events_filtered,
            }));
            aggregate.events_filtered += result.events_filtered;
            aggregate.warnings.extend(result.warnings);
            aggregate.metadata.extend(result.metadata);

            if !result.errors.is_empty() {
                for error in result.errors {
                    aggregate.add_error(error);
                }
                aggregate.metadata.insert("failed_stage".into(), json!(stage.name()));
                aggregate.metadata.insert("stages".into(), stage_reports.into());
                return aggregate;
            }
        }

        aggregate.events = std::mem::take(&mut ctx.events);
        aggregate.events_out = aggregate.events.len();
        aggregate.metadata.extend(ctx.extras);
        aggregate.metadata.insert("stages".into(), stage_reports.into());
        aggregate
    }
}
