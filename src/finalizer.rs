//! Dataset Finalizer
//!
//! Sorts by rank, re-checks rank uniqueness, and computes the summary
//! scalars and diagnostics for the reporting stage.

use crate::models::{DatasetDiagnostics, FinalDataset, LeaderboardRecord, PointsHistogram};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

pub fn finalize(records: Vec<LeaderboardRecord>, source: &str) -> FinalDataset {
    finalize_at(records, source, Utc::now())
}

/// `finalize` with an explicit generation time.
pub fn finalize_at(
    mut records: Vec<LeaderboardRecord>,
    source: &str,
    generated_at: DateTime<Utc>,
) -> FinalDataset {
    // stable: equal ranks keep accumulation order, so first-seen wins below
    records.sort_by_key(|r| r.rank);

    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    records.retain(|r| seen.insert(r.rank));
    let duplicates_dropped = before - records.len();
    if duplicates_dropped > 0 {
        warn!(
            duplicates_dropped,
            remaining = records.len(),
            "Duplicate ranks survived aggregation; kept first occurrence"
        );
    }

    let mut histogram = PointsHistogram::default();
    let mut min_points = f64::INFINITY;
    let mut max_points = f64::NEG_INFINITY;
    let mut sum = 0.0;
    let mut inconsistent_totals = 0usize;
    for r in &records {
        histogram.record(r.total_points);
        min_points = min_points.min(r.total_points);
        max_points = max_points.max(r.total_points);
        sum += r.total_points;
        if !r.is_total_consistent() {
            inconsistent_totals += 1;
        }
    }

    let total_entries = records.len();
    let (min_points, max_points, avg_points) = if total_entries == 0 {
        (0.0, 0.0, 0.0)
    } else {
        (min_points, max_points, sum / total_entries as f64)
    };

    let min_rank = records.first().map(|r| r.rank);
    let max_rank = records.last().map(|r| r.rank);
    let rank_gaps = match (min_rank, max_rank) {
        (Some(lo), Some(hi)) => (hi - lo + 1).saturating_sub(total_entries as u64),
        _ => 0,
    };
    if rank_gaps > 0 {
        warn!(rank_gaps, ?min_rank, ?max_rank, "Rank sequence has gaps");
    }
    if inconsistent_totals > 0 {
        warn!(
            inconsistent_totals,
            "Records whose totalPoints differs from the sum of its components"
        );
    }

    info!(
        total_entries,
        min_points, max_points, avg_points, "Dataset finalized"
    );

    FinalDataset {
        generated_at,
        source: source.to_string(),
        total_entries,
        min_points,
        max_points,
        avg_points,
        records,
        histogram,
        diagnostics: DatasetDiagnostics {
            duplicates_dropped,
            rank_gaps,
            inconsistent_totals,
            min_rank,
            max_rank,
        },
    }
}
