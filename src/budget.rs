//! Time budget allocation and the per-document resource budget.
//!
//! [`allocate`] is a pure function from a page count to the two durations
//! the pipeline plans with: the converter deadline and the rendering
//! estimate. [`ResourceBudget`] is the mutable ledger one document's run
//! charges against (wall clock, cumulative bytes, image count).

use crate::config::PipelineConfig;
use crate::job::PageCount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Page count assumed when a document's size cannot be determined.
///
/// A medium-sized deck: large enough that the converter gets a realistic
/// deadline, small enough that the render estimate does not block the stage.
pub const DEFAULT_PAGE_COUNT: usize = 10;

/// Durations derived from a document's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeAllocation {
    /// Hard deadline for the office-to-fixed-layout converter.
    pub conversion_timeout: Duration,
    /// Estimated rasterisation time. Only used to decide whether to start.
    pub render_estimate: Duration,
    /// The page count the durations were computed from.
    pub pages_assumed: usize,
    /// True when `pages_assumed` is [`DEFAULT_PAGE_COUNT`] standing in for
    /// an unknown or zero count.
    pub assumed_default: bool,
}

/// Compute the converter deadline and render estimate for a document.
///
/// ```text
/// conversion_timeout = min(base + pages × per_page, max)
/// render_estimate    = max(min_render, pages × per_page_render)
/// ```
///
/// An unknown or zero page count is replaced by [`DEFAULT_PAGE_COUNT`].
pub fn allocate(pages: PageCount, config: &PipelineConfig) -> TimeAllocation {
    let (n, assumed_default) = match pages {
        PageCount::Known(n) if n > 0 => (n, false),
        _ => (DEFAULT_PAGE_COUNT, true),
    };
    let n64 = n as u64;

    let conversion_secs = config
        .base_timeout_secs
        .saturating_add(n64.saturating_mul(config.per_page_timeout_secs))
        .min(config.max_timeout_secs);
    let render_secs = n64
        .saturating_mul(config.per_page_render_secs)
        .max(config.min_render_secs);

    TimeAllocation {
        conversion_timeout: Duration::from_secs(conversion_secs),
        render_estimate: Duration::from_secs(render_secs),
        pages_assumed: n,
        assumed_default,
    }
}

/// Why a stage stopped producing images before running out of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Cumulative bytes crossed `max_total_image_bytes`.
    ByteBudget,
    /// `max_image_count` images have been produced.
    ImageCount,
    /// The document's wall-clock ceiling is (nearly) spent.
    TimeBudget,
    /// `max_pages` pages have been rendered.
    PageLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::ByteBudget => "image byte budget reached",
            StopReason::ImageCount => "image count limit reached",
            StopReason::TimeBudget => "time budget exhausted",
            StopReason::PageLimit => "page limit reached",
        };
        f.write_str(s)
    }
}

/// Ledger for one document's run.
///
/// Owned by exactly one pipeline run; `Clone` only so a copy can survive a
/// blocking task that panics while holding the original.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    start: Instant,
    max_wall_clock: Duration,
    max_cumulative_bytes: u64,
    max_image_count: usize,
    bytes_so_far: u64,
    images_so_far: usize,
}

impl ResourceBudget {
    pub fn new(max_wall_clock: Duration, max_cumulative_bytes: u64, max_image_count: usize) -> Self {
        Self {
            start: Instant::now(),
            max_wall_clock,
            max_cumulative_bytes,
            max_image_count,
            bytes_so_far: 0,
            images_so_far: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.total_budget(),
            config.max_total_image_bytes,
            config.max_image_count,
        )
    }

    /// Back-date the start of the run (used to model time already spent).
    pub fn started_at(mut self, start: Instant) -> Self {
        self.start = start;
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before the wall-clock ceiling; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.max_wall_clock.saturating_sub(self.elapsed())
    }

    pub fn is_time_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far
    }

    pub fn images_so_far(&self) -> usize {
        self.images_so_far
    }

    pub fn max_image_count(&self) -> usize {
        self.max_image_count
    }

    pub fn max_cumulative_bytes(&self) -> u64 {
        self.max_cumulative_bytes
    }

    /// Charge one produced image. Returns the limit it hit, if any.
    ///
    /// The image being charged is always kept; the return value tells the
    /// caller to stop producing more.
    pub fn charge(&mut self, bytes: u64) -> Option<StopReason> {
        self.bytes_so_far = self.bytes_so_far.saturating_add(bytes);
        self.images_so_far += 1;
        self.limit_reached()
    }

    /// The first exhausted byte/count limit, if any.
    pub fn limit_reached(&self) -> Option<StopReason> {
        if self.bytes_so_far > self.max_cumulative_bytes {
            Some(StopReason::ByteBudget)
        } else if self.images_so_far >= self.max_image_count {
            Some(StopReason::ImageCount)
        } else {
            None
        }
    }
}
