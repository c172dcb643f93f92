//! Stage ordering and the "is it worth starting?" decision.
//!
//! The order of stages never changes at run time; only whether each one
//! runs does. A stage is started only when enough of the time it is
//! expected to need is still available, so a stage is skipped outright
//! rather than started and abandoned halfway.

use crate::budget::TimeAllocation;
use crate::config::PipelineConfig;
use crate::job::DocumentKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One independently failable unit of the pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pull raster images straight out of the container.
    EmbeddedExtract,
    /// Office document → PDF via an external converter.
    ConvertToFixedLayout,
    /// PDF pages → raster images.
    Rasterize,
    /// Embedded EMF/WMF drawings → raster images.
    VectorFallback,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::EmbeddedExtract => "embedded extraction",
            Stage::ConvertToFixedLayout => "fixed-layout conversion",
            Stage::Rasterize => "rasterisation",
            Stage::VectorFallback => "vector conversion",
        };
        f.write_str(s)
    }
}

/// Why a stage was not started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The stage does not apply to this kind of document.
    NotApplicable,
    /// Switched off in the configuration.
    Disabled,
    /// An earlier stage did not produce this stage's input.
    MissingInput,
    /// Vector fallback runs only once at least one page was rendered.
    NoRenderedPages,
    /// Not enough of the document's time budget is left.
    InsufficientTime { needed: Duration, remaining: Duration },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotApplicable => f.write_str("not applicable"),
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::MissingInput => f.write_str("no input from earlier stage"),
            SkipReason::NoRenderedPages => f.write_str("no rendered pages"),
            SkipReason::InsufficientTime { needed, remaining } => write!(
                f,
                "time budget exhausted ({:.1}s left, {:.1}s needed)",
                remaining.as_secs_f64(),
                needed.as_secs_f64()
            ),
        }
    }
}

/// Outcome of asking whether a stage should start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Run,
    Skip(SkipReason),
}

impl Gate {
    pub fn is_run(&self) -> bool {
        matches!(self, Gate::Run)
    }
}

/// A stage together with the fraction of its estimated time that must remain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedStage {
    pub stage: Stage,
    pub min_time_fraction: f64,
}

/// Ordered stages for one document and the thresholds that gate them.
#[derive(Debug, Clone)]
pub struct StagePlan {
    stages: Vec<PlannedStage>,
    safety_margin: Duration,
    vector_floor: Duration,
}

impl StagePlan {
    /// The fixed stage order, minus stages that cannot apply to `kind`.
    pub fn for_kind(kind: DocumentKind, config: &PipelineConfig) -> Self {
        let threshold = config.attempt_threshold;
        let mut stages = Vec::with_capacity(4);
        if kind.is_container() {
            stages.push(PlannedStage {
                stage: Stage::EmbeddedExtract,
                min_time_fraction: 0.0,
            });
        }
        if kind.needs_conversion() {
            stages.push(PlannedStage {
                stage: Stage::ConvertToFixedLayout,
                min_time_fraction: threshold,
            });
        }
        stages.push(PlannedStage {
            stage: Stage::Rasterize,
            min_time_fraction: threshold,
        });
        if kind.is_container() {
            stages.push(PlannedStage {
                stage: Stage::VectorFallback,
                min_time_fraction: 1.0,
            });
        }
        Self {
            stages,
            safety_margin: config.safety_margin(),
            vector_floor: Duration::from_secs(config.vector_min_remaining_secs),
        }
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages.iter().map(|p| p.stage)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.iter().any(|p| p.stage == stage)
    }

    /// Time a stage must have available before it is started.
    ///
    /// * conversion: `threshold × (conversion_timeout + render_estimate + margin)`,
    ///   since converting is pointless if rendering cannot follow
    /// * rasterisation: `threshold × render_estimate`
    /// * vector fallback: the fixed floor
    /// * embedded extraction: nothing; it always runs
    pub fn required_time(&self, stage: Stage, alloc: &TimeAllocation) -> Duration {
        let fraction = self
            .stages
            .iter()
            .find(|p| p.stage == stage)
            .map(|p| p.min_time_fraction)
            .unwrap_or(1.0);
        let estimate = match stage {
            Stage::EmbeddedExtract => Duration::ZERO,
            Stage::ConvertToFixedLayout => {
                alloc.conversion_timeout + alloc.render_estimate + self.safety_margin
            }
            Stage::Rasterize => alloc.render_estimate,
            Stage::VectorFallback => self.vector_floor,
        };
        estimate.mul_f64(fraction)
    }

    /// Decide whether `stage` starts, given the time left and how many pages
    /// were rendered so far.
    pub fn gate(
        &self,
        stage: Stage,
        remaining: Duration,
        alloc: &TimeAllocation,
        pages_rendered: usize,
    ) -> Gate {
        if !self.contains(stage) {
            return Gate::Skip(SkipReason::NotApplicable);
        }
        if stage == Stage::EmbeddedExtract {
            return Gate::Run;
        }
        if stage == Stage::VectorFallback && pages_rendered == 0 {
            return Gate::Skip(SkipReason::NoRenderedPages);
        }
        let needed = self.required_time(stage, alloc);
        if remaining.is_zero() || remaining <= needed {
            return Gate::Skip(SkipReason::InsufficientTime { needed, remaining });
        }
        Gate::Run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::allocate;
    use crate::job::PageCount;

    fn alloc(config: &PipelineConfig, pages: usize) -> TimeAllocation {
        allocate(PageCount::Known(pages), config)
    }

    #[test]
    fn slide_deck_runs_all_stages_in_order() {
        let c = PipelineConfig::default();
        let plan = StagePlan::for_kind(DocumentKind::SlideDeck, &c);
        let stages: Vec<Stage> = plan.stages().collect();
        assert_eq!(
            stages,
            vec![
                Stage::EmbeddedExtract,
                Stage::ConvertToFixedLayout,
                Stage::Rasterize,
                Stage::VectorFallback
            ]
        );
    }

    #[test]
    fn pdf_only_rasterises() {
        let c = PipelineConfig::default();
        let plan = StagePlan::for_kind(DocumentKind::FixedLayout, &c);
        let stages: Vec<Stage> = plan.stages().collect();
        assert_eq!(stages, vec![Stage::Rasterize]);
        let a = alloc(&c, 3);
        assert_eq!(
            plan.gate(Stage::ConvertToFixedLayout, Duration::from_secs(999), &a, 0),
            Gate::Skip(SkipReason::NotApplicable)
        );
    }

    #[test]
    fn conversion_needs_threshold_of_full_estimate() {
        let c = PipelineConfig::builder()
            .base_timeout_secs(30)
            .per_page_timeout_secs(3)
            .min_render_secs(5)
            .per_page_render_secs(2)
            .safety_margin_secs(10)
            .attempt_threshold(0.8)
            .build()
            .unwrap();
        let plan = StagePlan::for_kind(DocumentKind::SlideDeck, &c);
        // 10 slides: conversion 60s + render 20s + margin 10s = 90s → 72s needed
        let a = alloc(&c, 10);
        assert_eq!(
            plan.required_time(Stage::ConvertToFixedLayout, &a),
            Duration::from_secs(72)
        );
        assert!(plan
            .gate(Stage::ConvertToFixedLayout, Duration::from_secs(73), &a, 0)
            .is_run());
        assert!(!plan
            .gate(Stage::ConvertToFixedLayout, Duration::from_secs(71), &a, 0)
            .is_run());
    }

    #[test]
    fn exactly_the_estimate_is_not_enough() {
        let c = PipelineConfig::builder()
            .vector_min_remaining_secs(20)
            .build()
            .unwrap();
        let plan = StagePlan::for_kind(DocumentKind::SlideDeck, &c);
        let a = alloc(&c, 10);
        let needed = plan.required_time(Stage::ConvertToFixedLayout, &a);
        assert!(!plan.gate(Stage::ConvertToFixedLayout, needed, &a, 0).is_run());
        assert!(plan
            .gate(Stage::ConvertToFixedLayout, needed + Duration::from_secs(1), &a, 0)
            .is_run());
        assert!(!plan
            .gate(Stage::VectorFallback, Duration::from_secs(20), &a, 3)
            .is_run());
    }

    #[test]
    fn embedded_runs_with_no_time_left() {
        let c = PipelineConfig::default();
        let plan = StagePlan::for_kind(DocumentKind::SlideDeck, &c);
        let a = alloc(&c, 10);
        assert!(plan.gate(Stage::EmbeddedExtract, Duration::ZERO, &a, 0).is_run());
    }

    #[test]
    fn vector_needs_pages_and_floor() {
        let c = PipelineConfig::builder()
            .vector_min_remaining_secs(20)
            .build()
            .unwrap();
        let plan = StagePlan::for_kind(DocumentKind::SlideDeck, &c);
        let a = alloc(&c, 10);
        assert_eq!(
            plan.gate(Stage::VectorFallback, Duration::from_secs(100), &a, 0),
            Gate::Skip(SkipReason::NoRenderedPages)
        );
        assert!(!plan
            .gate(Stage::VectorFallback, Duration::from_secs(19), &a, 3)
            .is_run());
        assert!(plan
            .gate(Stage::VectorFallback, Duration::from_secs(21), &a, 3)
            .is_run());
    }

    #[test]
    fn skip_reason_mentions_time_budget() {
        let reason = SkipReason::InsufficientTime {
            needed: Duration::from_secs(30),
            remaining: Duration::from_secs(2),
        };
        assert!(reason.to_string().contains("time budget exhausted"));
    }
}
