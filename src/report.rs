use serde::{Deserialize, Serialize};

use crate::settings::Settings;
use crate::store::{PageGroupRow, SampleRow, SampleStore, SlowQueryHit, StoreError};

// ─── Configuration ───────────────────────────────────────────────

/// Below this many window samples the percentile estimate is unreliable,
/// so the report substitutes the worst observed value.
pub const MIN_P95_SAMPLES: i64 = 20;

/// How many grouped pages, outliers, and slow queries each report carries.
pub const TOP_PAGES: i64 = 15;
pub const TOP_OUTLIERS: i64 = 15;
pub const TOP_SLOW_QUERIES: i64 = 15;

/// A (screen_id, hook_suffix) group needs this many samples to appear.
pub const MIN_PAGE_GROUP_SAMPLES: i64 = 3;

/// How many individual rows the expanded report's recent feed carries.
pub const MAX_RECENT_SAMPLES: i64 = 200;

// ─── Public types ────────────────────────────────────────────────

/// Whether to include the recent-samples feed. The expanded form is
/// meant for export; the summary form backs the report view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detail {
    Summary,
    Expanded,
}

/// Aggregates over the window [since, now]. A pure function of the
/// current row set and the window boundary: nothing is cached between
/// calls, and computing a report never mutates the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total_samples: i64,
    /// Mean load_ms, rounded to nearest integer; 0 when the window is empty.
    pub avg_load_ms: i64,
    /// Rank-select order-statistic estimate, not a distribution fit.
    pub p95_load_ms_estimate: i64,
    pub slowest_pages: Vec<PageGroupRow>,
    pub worst_outliers: Vec<SampleRow>,
    /// Empty unless slow-query capture is configured on.
    pub slow_queries: Vec<SlowQueryHit>,
    /// Only present in the expanded form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_samples: Option<Vec<SampleRow>>,
}

// ─── Aggregation ─────────────────────────────────────────────────

/// Compute the report over [since_ms, now]. Read-only.
pub fn compute(
    store: &SampleStore,
    settings: &Settings,
    since_ms: i64,
    detail: Detail,
) -> Result<Report, StoreError> {
    let total_samples = store.count_since(since_ms)?;

    let avg_load_ms = store
        .avg_load_since(since_ms)?
        .map(|avg| avg.round() as i64)
        .unwrap_or(0);

    let p95_load_ms_estimate = if total_samples < MIN_P95_SAMPLES {
        store.max_load_since(since_ms)?.unwrap_or(0)
    } else {
        let offset = ((total_samples as f64 * 0.95).floor() as i64).clamp(0, total_samples - 1);
        store.load_at_rank(since_ms, offset)?.unwrap_or(0)
    };

    let slow_queries = if settings.log_slow_queries_if_available {
        store.slow_queries_since(since_ms, TOP_SLOW_QUERIES)?
    } else {
        Vec::new()
    };

    let recent_samples = match detail {
        Detail::Expanded => Some(store.recent_samples(since_ms, MAX_RECENT_SAMPLES)?),
        Detail::Summary => None,
    };

    Ok(Report {
        total_samples,
        avg_load_ms,
        p95_load_ms_estimate,
        slowest_pages: store.slowest_pages(since_ms, MIN_PAGE_GROUP_SAMPLES, TOP_PAGES)?,
        worst_outliers: store.worst_outliers(since_ms, TOP_OUTLIERS)?,
        slow_queries,
        recent_samples,
    })
}

// ─── Tests ───────────────────────────────────────────────────────
