//! Leaderboard Page Fetcher
//!
//! One bounded-timeout GET per call. Classifies the outcome into a parsed
//! page or a typed failure; retry and strategy decisions live in the driver
//! and resolver.

use crate::models::{LeaderboardRecord, PageResponse, PaginationHints};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Query parameters for one request. Empty means a bare GET.
pub type QueryParams = Vec<(&'static str, String)>;

/// Top-level keys the upstream API has been seen to use for the record array.
pub const RECORD_ARRAY_KEYS: [&str; 2] = ["data", "leaderboard"];

const BODY_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection failure or timeout
    Network,
    /// Non-2xx response
    HttpStatus,
    /// Body is not JSON or not a recognizable leaderboard page
    Decode,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::HttpStatus => write!(f, "http_status"),
            Self::Decode => write!(f, "decode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub detail: String,
    pub status: Option<u16>,
}

impl FetchError {
    pub fn network(detail: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Network,
            detail: detail.into(),
            status: None,
        }
    }

    pub fn http_status(status: u16, detail: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::HttpStatus,
            detail: detail.into(),
            status: Some(status),
        }
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Decode,
            detail: detail.into(),
            status: None,
        }
    }

    pub fn is_network(&self) -> bool {
        self.kind == FetchErrorKind::Network
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} error (HTTP {}): {}", self.kind, status, self.detail),
            None => write!(f, "{} error: {}", self.kind, self.detail),
        }
    }
}

impl std::error::Error for FetchError {}

/// Source of leaderboard pages.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Endpoint recorded as the dataset's provenance.
    fn endpoint(&self) -> &str;

    async fn fetch(&self, params: &[(&'static str, String)]) -> Result<PageResponse, FetchError>;
}

/// reqwest-backed fetcher for the live API.
#[derive(Clone)]
pub struct HttpPageFetcher {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new(endpoint: &str, request_timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(user_agent)
            .build()
            .context("Failed to build leaderboard HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            request_timeout,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, params: &[(&'static str, String)]) -> Result<PageResponse, FetchError> {
        let request = self.client.get(&self.endpoint).query(params);

        let response = match timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(FetchError::network(e.to_string())),
            Err(_) => {
                return Err(FetchError::network(format!(
                    "request timed out after {}ms",
                    self.request_timeout.as_millis()
                )))
            }
        };

        let status = response.status();
        // The body read is bounded by the client-level timeout.
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::network(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::http_status(status.as_u16(), preview(&body)));
        }

        debug!(
            params = ?params,
            body_len = body.len(),
            "Leaderboard response received"
        );
        parse_page(&body)
    }
}

/// Parse a response body into a page.
///
/// The record array may sit under `data` or `leaderboard`; pagination hints
/// come from the optional `meta` object.
pub fn parse_page(body: &str) -> Result<PageResponse, FetchError> {
    let value: Value = serde_json::from_str(body).map_err(|e| {
        FetchError::decode(format!("invalid JSON ({}): {}", e, preview(body)))
    })?;

    let Value::Object(mut top) = value else {
        return Err(FetchError::decode("top-level JSON value is not an object"));
    };

    let Some((key, raw_records)) = RECORD_ARRAY_KEYS
        .iter()
        .find_map(|k| top.remove(*k).map(|v| (*k, v)))
    else {
        let keys: Vec<&String> = top.keys().collect();
        return Err(FetchError::decode(format!(
            "no record array (expected one of {:?}); keys present: {:?}",
            RECORD_ARRAY_KEYS, keys
        )));
    };

    let Value::Array(items) = raw_records else {
        return Err(FetchError::decode(format!("`{}` is not an array", key)));
    };

    let mut records = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let record: LeaderboardRecord = serde_json::from_value(item)
            .map_err(|e| FetchError::decode(format!("record {} in `{}`: {}", idx, key, e)))?;
        if record.rank == 0 {
            return Err(FetchError::decode(format!("record {} has rank 0", idx)));
        }
        if record.wallet_address.trim().is_empty() {
            return Err(FetchError::decode(format!(
                "record {} (rank {}) has an empty walletAddress",
                idx, record.rank
            )));
        }
        records.push(record);
    }

    let hints = match top.remove("meta") {
        None | Some(Value::Null) => PaginationHints::default(),
        // Unexpected hint types are not worth losing the page over.
        Some(meta) => PaginationHints::from_meta(&meta),
    };

    Ok(PageResponse { records, hints })
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}
