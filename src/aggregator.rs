//! Page Aggregation
//!
//! `FetchState` is the single owner of everything accumulated during a run.
//! Records enter it only through `accumulate`, which drops ranks already
//! seen, so `seen_ranks.len() == accumulated.len()` always holds.

use crate::models::{LeaderboardRecord, PaginationHints};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOutcome {
    /// This many previously unseen records were added
    NewData(usize),
    /// Every record on the page had been seen before
    Duplicate,
    /// The page carried no records
    Empty,
}

impl AggregationOutcome {
    pub fn new_records(&self) -> usize {
        match self {
            Self::NewData(n) => *n,
            Self::Duplicate | Self::Empty => 0,
        }
    }

    /// Empty and duplicate pages both count toward the stale-page guard.
    pub fn is_stale(&self) -> bool {
        !matches!(self, Self::NewData(_))
    }
}

#[derive(Debug, Default)]
pub struct FetchState {
    accumulated: Vec<LeaderboardRecord>,
    seen_ranks: HashSet<u64>,
    max_rank: Option<u64>,
    /// Last cursor the server handed out
    pub cursor: Option<String>,
    /// Requests completed (successful or not)
    pub page_count: u32,
    pub consecutive_failures: u32,
    /// Consecutive pages that were empty or entirely duplicate
    pub consecutive_stale: u32,
}

impl FetchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the page's unseen records in page order.
    pub fn accumulate(&mut self, records: Vec<LeaderboardRecord>) -> AggregationOutcome {
        if records.is_empty() {
            return AggregationOutcome::Empty;
        }

        let mut added = 0usize;
        for record in records {
            if !self.seen_ranks.insert(record.rank) {
                continue;
            }
            self.max_rank = Some(self.max_rank.map_or(record.rank, |m| m.max(record.rank)));
            self.accumulated.push(record);
            added += 1;
        }

        debug_assert_eq!(self.seen_ranks.len(), self.accumulated.len());

        if added == 0 {
            AggregationOutcome::Duplicate
        } else {
            AggregationOutcome::NewData(added)
        }
    }

    /// Remember the newest cursor; an absent cursor keeps the last known one.
    pub fn record_hints(&mut self, hints: &PaginationHints) {
        if let Some(after) = &hints.after {
            self.cursor = Some(after.clone());
        }
    }

    /// Bookkeeping for stale-page detection; returns the updated streak.
    pub fn record_outcome(&mut self, outcome: AggregationOutcome) -> u32 {
        self.consecutive_failures = 0;
        if outcome.is_stale() {
            self.consecutive_stale += 1;
        } else {
            self.consecutive_stale = 0;
        }
        self.consecutive_stale
    }

    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }

    pub fn max_rank(&self) -> Option<u64> {
        self.max_rank
    }

    pub fn records(&self) -> &[LeaderboardRecord] {
        &self.accumulated
    }

    /// Hand the accumulated records over for finalization.
    pub fn into_records(self) -> Vec<LeaderboardRecord> {
        self.accumulated
    }
}
