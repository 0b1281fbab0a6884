//! Reya Leaderboard Harvester Library
//!
//! Pulls the complete incentives leaderboard from the Reya API, coping with
//! a pagination contract that is only partially documented, and produces a
//! deduplicated, rank-ordered dataset for the reporting stage.
//!
//! Pipeline: `fetcher` (one page) -> `resolver` (which parameters next) ->
//! `aggregator` (dedup into `FetchState`) -> `finalizer` -> `artifact`.
//! `driver` runs the loop.

pub mod aggregator;
pub mod artifact;
pub mod config;
pub mod driver;
pub mod fetcher;
pub mod finalizer;
pub mod models;
pub mod resolver;

pub use config::HarvestConfig;
pub use driver::{
    collect_leaderboard, CancelHandle, CancelSignal, HarvestError, HarvestRun, Termination,
};
pub use fetcher::{FetchError, HttpPageFetcher, PageFetcher};
pub use models::{FinalDataset, LeaderboardRecord};
