//! Artifact I/O
//!
//! The finalized dataset is persisted as pretty-printed JSON for the
//! reporting stage. Writes go to a sibling temp file that is renamed into
//! place, so a reader never observes a half-written artifact.

use crate::models::{DatasetDiagnostics, FinalDataset, PointsHistogram};
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Slack for comparing the persisted scalars, which went through JSON.
const POINTS_EPSILON: f64 = 1e-9;

pub fn write_artifact(path: &Path, dataset: &FinalDataset) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(dataset).context("Failed to serialize dataset")?;

    let temp_path = path.with_extension("json.tmp");
    if let Err(e) = write_then_rename(&temp_path, path, json.as_bytes()) {
        // never leave a stray temp file next to the artifact
        if temp_path.exists() {
            if let Err(cleanup) = fs::remove_file(&temp_path) {
                warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp file");
            }
        }
        return Err(e);
    }

    info!(
        path = %path.display(),
        entries = dataset.total_entries,
        bytes = json.len(),
        "Artifact written"
    );
    Ok(())
}

fn write_then_rename(temp_path: &Path, path: &Path, content: &[u8]) -> Result<()> {
    let file = File::create(temp_path)
        .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(content)
        .and_then(|_| writer.flush())
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    drop(writer);

    fs::rename(temp_path, path)
        .with_context(|| format!("Failed to move artifact into place at {}", path.display()))
}

/// Read an artifact back; histogram and diagnostics are recomputed since
/// they are not persisted.
pub fn load_artifact(path: &Path) -> Result<FinalDataset> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifact {}", path.display()))?;
    let mut dataset: FinalDataset = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

    let mut histogram = PointsHistogram::default();
    let mut inconsistent_totals = 0;
    for r in &dataset.records {
        histogram.record(r.total_points);
        if !r.is_total_consistent() {
            inconsistent_totals += 1;
        }
    }
    let min_rank = dataset.records.iter().map(|r| r.rank).min();
    let max_rank = dataset.records.iter().map(|r| r.rank).max();
    let rank_gaps = match (min_rank, max_rank) {
        (Some(lo), Some(hi)) => (hi - lo + 1).saturating_sub(dataset.records.len() as u64),
        _ => 0,
    };

    dataset.histogram = histogram;
    dataset.diagnostics = DatasetDiagnostics {
        duplicates_dropped: 0,
        rank_gaps,
        inconsistent_totals,
        min_rank,
        max_rank,
    };
    Ok(dataset)
}

/// Structural checks on a loaded artifact. Empty means valid.
pub fn verify_artifact(dataset: &FinalDataset) -> Vec<String> {
    let mut problems = Vec::new();

    if dataset.total_entries != dataset.records.len() {
        problems.push(format!(
            "totalEntries is {} but leaderboard holds {} records",
            dataset.total_entries,
            dataset.records.len()
        ));
    }

    for pair in dataset.records.windows(2) {
        if pair[1].rank <= pair[0].rank {
            problems.push(format!(
                "ranks not strictly ascending: {} followed by {}",
                pair[0].rank, pair[1].rank
            ));
            break;
        }
    }

    if !dataset.records.is_empty()
        && (dataset.min_points > dataset.avg_points + POINTS_EPSILON
            || dataset.avg_points > dataset.max_points + POINTS_EPSILON)
    {
        problems.push(format!(
            "points summary out of order: min {} avg {} max {}",
            dataset.min_points, dataset.avg_points, dataset.max_points
        ));
    }

    problems
}
