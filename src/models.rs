//! Leaderboard data model
//!
//! Wire shapes for the upstream leaderboard API and the finalized dataset
//! handed to the reporting stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// One participant's ranking entry, as returned by a single page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRecord {
    pub rank: u64,
    pub wallet_address: String,
    #[serde(default, deserialize_with = "de_points")]
    pub trading_points: f64,
    #[serde(default, deserialize_with = "de_points")]
    pub staking_points: f64,
    #[serde(default, deserialize_with = "de_points")]
    pub signal_points: f64,
    #[serde(default, deserialize_with = "de_points")]
    pub total_points: f64,
}

/// Slack allowed between `totalPoints` and the sum of its components.
pub const TOTAL_POINTS_TOLERANCE: f64 = 0.01;

impl LeaderboardRecord {
    pub fn component_sum(&self) -> f64 {
        self.trading_points + self.staking_points + self.signal_points
    }

    /// Upstream rounds component scores, so this is a soft check only.
    pub fn is_total_consistent(&self) -> bool {
        (self.component_sum() - self.total_points).abs() <= TOTAL_POINTS_TOLERANCE
    }
}

/// Points arrive as numbers or numeric strings depending on the endpoint.
/// Non-finite values (`"NaN"`, `"inf"`) are rejected.
fn de_points<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    let points = match v {
        Value::Null => return Ok(0.0),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("points out of range"))?,
        Value::String(s) if s.trim().is_empty() => return Ok(0.0),
        Value::String(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected number for points, got {}",
                other
            )))
        }
    };
    if !points.is_finite() {
        return Err(serde::de::Error::custom(format!(
            "non-finite points value {}",
            points
        )));
    }
    Ok(points)
}

/// Cursor-like metadata from the response's `meta` object.
///
/// Opaque to the fetcher; only the resolver interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaginationHints {
    #[serde(default, deserialize_with = "de_cursor")]
    pub after: Option<String>,
    #[serde(rename = "hasMore", default)]
    pub has_more: Option<bool>,
}

impl PaginationHints {
    /// Read `after` and `hasMore` independently; a malformed field is
    /// dropped on its own without discarding the other.
    pub fn from_meta(meta: &Value) -> Self {
        let Value::Object(fields) = meta else {
            debug!(meta = %meta, "Ignoring non-object pagination metadata");
            return Self::default();
        };

        let after = match fields.get("after") {
            None => None,
            Some(raw) => de_cursor(raw.clone()).unwrap_or_else(|e| {
                debug!(error = %e, after = %raw, "Ignoring unparseable cursor");
                None
            }),
        };

        let has_more = match fields.get("hasMore") {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                debug!(has_more = %other, "Ignoring non-boolean hasMore");
                None
            }
        };

        Self { after, has_more }
    }

    pub fn is_empty(&self) -> bool {
        self.after.is_none() && self.has_more.is_none()
    }
}

fn de_cursor<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "unsupported cursor value: {}",
            other
        ))),
    }
}

/// Output of one successful page request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResponse {
    pub records: Vec<LeaderboardRecord>,
    pub hints: PaginationHints,
}

impl PageResponse {
    pub fn first_rank(&self) -> Option<u64> {
        self.records.first().map(|r| r.rank)
    }

    pub fn last_rank(&self) -> Option<u64> {
        self.records.last().map(|r| r.rank)
    }
}

/// Upper bounds of the points histogram buckets; the final bucket is open.
pub const HISTOGRAM_BOUNDS: [f64; 11] = [
    1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

pub const HISTOGRAM_LABELS: [&str; 12] = [
    "0-1",
    "1-5",
    "5-10",
    "10-20",
    "20-50",
    "50-100",
    "100-200",
    "200-500",
    "500-1000",
    "1000-2000",
    "2000-5000",
    "5000+",
];

/// Fixed-boundary distribution of `totalPoints`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointsHistogram {
    pub counts: [u64; 12],
}

impl PointsHistogram {
    pub fn bucket_index(points: f64) -> usize {
        HISTOGRAM_BOUNDS
            .iter()
            .position(|&upper| points < upper)
            .unwrap_or(HISTOGRAM_BOUNDS.len())
    }

    pub fn record(&mut self, points: f64) {
        self.counts[Self::bucket_index(points)] += 1;
    }

    pub fn count(&self, label: &str) -> Option<u64> {
        HISTOGRAM_LABELS
            .iter()
            .position(|l| *l == label)
            .map(|i| self.counts[i])
    }

    /// Non-empty buckets in boundary order.
    pub fn non_empty(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        HISTOGRAM_LABELS
            .iter()
            .zip(self.counts.iter())
            .filter(|(_, c)| **c > 0)
            .map(|(l, c)| (*l, *c))
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Data-quality findings computed at finalize time. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetDiagnostics {
    pub duplicates_dropped: usize,
    pub rank_gaps: u64,
    pub inconsistent_totals: usize,
    pub min_rank: Option<u64>,
    pub max_rank: Option<u64>,
}

/// The deduplicated, rank-ordered dataset plus summary scalars.
///
/// Serializes to the artifact contract consumed by the reporting stage:
/// `timestamp`, `source`, `totalEntries`, `minPoints`, `maxPoints`,
/// `avgPoints`, `leaderboard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDataset {
    #[serde(rename = "timestamp", with = "utc_seconds")]
    pub generated_at: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "totalEntries")]
    pub total_entries: usize,
    #[serde(rename = "minPoints")]
    pub min_points: f64,
    #[serde(rename = "maxPoints")]
    pub max_points: f64,
    #[serde(rename = "avgPoints")]
    pub avg_points: f64,
    #[serde(rename = "leaderboard")]
    pub records: Vec<LeaderboardRecord>,
    #[serde(skip)]
    pub histogram: PointsHistogram,
    #[serde(skip)]
    pub diagnostics: DatasetDiagnostics,
}

/// ISO-8601 UTC with second precision, e.g. `2024-01-25T00:00:00Z`.
pub(crate) mod utc_seconds {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&dt.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, FORMAT) {
            return Ok(naive.and_utc());
        }
        // Accept any RFC 3339 timestamp written by other tooling.
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
