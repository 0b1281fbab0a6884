//! Harvest Configuration
//!
//! Layered: defaults, then an optional TOML file, then `LEADERBOARD_*`
//! environment variables. CLI flags are applied last by the binary.

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_BASE_URL: &str = "https://api.reya.xyz/api/incentives/leaderBoard/total";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Leaderboard endpoint
    pub base_url: String,
    /// Hard cap on requests issued in one run
    pub max_pages: u32,
    pub request_timeout_ms: u64,
    /// Pause between page requests
    pub inter_request_delay_ms: u64,
    /// Consecutive empty/duplicate pages tolerated before giving up
    pub max_consecutive_stale: u32,
    /// Extra attempts for a request that failed at the network level
    pub max_network_retries: u32,
    pub retry_backoff_ms: u64,
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            // ~80k records at ~20 per page, with headroom
            max_pages: 10_000,
            request_timeout_ms: 30_000,
            inter_request_delay_ms: 300,
            max_consecutive_stale: 5,
            max_network_retries: 3,
            retry_backoff_ms: 500,
            user_agent: concat!("reya-leaderboard/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HarvestConfig {
    /// Defaults, overlaid with a TOML file when given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    /// Overlay values from a variable lookup; unparseable values are ignored.
    fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LEADERBOARD_BASE_URL") {
            if !v.trim().is_empty() {
                self.base_url = v.trim().to_string();
            }
        }
        parse_var(&lookup, "LEADERBOARD_MAX_PAGES", &mut self.max_pages);
        parse_var(
            &lookup,
            "LEADERBOARD_REQUEST_TIMEOUT_MS",
            &mut self.request_timeout_ms,
        );
        parse_var(
            &lookup,
            "LEADERBOARD_INTER_REQUEST_DELAY_MS",
            &mut self.inter_request_delay_ms,
        );
        parse_var(
            &lookup,
            "LEADERBOARD_MAX_CONSECUTIVE_STALE",
            &mut self.max_consecutive_stale,
        );
        parse_var(
            &lookup,
            "LEADERBOARD_MAX_NETWORK_RETRIES",
            &mut self.max_network_retries,
        );
        parse_var(
            &lookup,
            "LEADERBOARD_RETRY_BACKOFF_MS",
            &mut self.retry_backoff_ms,
        );
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base_url: {}", self.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("base_url must be http(s), got scheme {}", url.scheme());
        }
        if self.max_pages == 0 {
            bail!("max_pages must be at least 1");
        }
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be positive");
        }
        if self.max_consecutive_stale == 0 {
            bail!("max_consecutive_stale must be at least 1");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}
