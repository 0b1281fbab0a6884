//! Harvest Driver
//!
//! Strictly sequential fetch loop: each request's parameters depend on the
//! previous response, so pages are never fetched concurrently. The loop owns
//! `FetchState` and the resolver; the only suspension points are the request
//! itself, retry backoff and the inter-request delay, all of which yield to
//! cancellation.

use crate::aggregator::FetchState;
use crate::config::HarvestConfig;
use crate::fetcher::{FetchError, PageFetcher, QueryParams};
use crate::finalizer::finalize;
use crate::models::{FinalDataset, PageResponse, PaginationHints};
use crate::resolver::{
    ExhaustReason, PageObservation, PaginationResolver, PaginationState, ParamShape,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
const PROGRESS_EVERY_PAGES: u32 = 100;

// =============================================================================
// CANCELLATION
// =============================================================================

/// Requests that a running harvest stop after its current step.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if it never is.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// TERMINATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopGuard {
    MaxPages,
    ConsecutiveStale,
}

impl std::fmt::Display for LoopGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxPages => write!(f, "max_pages"),
            Self::ConsecutiveStale => write!(f, "consecutive_stale_pages"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exhausted(ExhaustReason),
    LoopGuard(LoopGuard),
    Cancelled,
}

impl Termination {
    /// Clean runs ended on their own; a cancelled run was cut short.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted(reason) => write!(f, "EXHAUSTED ({})", reason),
            Self::LoopGuard(guard) => write!(f, "loop guard ({})", guard),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Nothing was accumulated, so there is nothing to finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestError {
    NoRecords { termination: Termination, pages: u32 },
}

impl std::fmt::Display for HarvestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoRecords { termination, pages } => write!(
                f,
                "no leaderboard records retrieved after {} request(s) (terminated: {})",
                pages, termination
            ),
        }
    }
}

impl std::error::Error for HarvestError {}

// =============================================================================
// DRIVER LOOP
// =============================================================================

/// Raw result of the fetch loop, before finalization.
#[derive(Debug)]
pub struct Harvest {
    pub state: FetchState,
    pub termination: Termination,
    pub final_pagination: PaginationState,
}

/// A finalized run.
#[derive(Debug)]
pub struct HarvestRun {
    pub dataset: FinalDataset,
    pub termination: Termination,
    pub pages: u32,
}

/// Fetch, aggregate and finalize. Partial results from a cancelled run are
/// still finalized.
pub async fn collect_leaderboard<F>(
    fetcher: &F,
    config: &HarvestConfig,
    cancel: CancelSignal,
) -> Result<HarvestRun, HarvestError>
where
    F: PageFetcher + ?Sized,
{
    let Harvest {
        state, termination, ..
    } = harvest(fetcher, config, cancel).await;
    let pages = state.page_count;

    if state.is_empty() {
        error!(%termination, pages, "No records retrieved; nothing to finalize");
        return Err(HarvestError::NoRecords { termination, pages });
    }

    let dataset = finalize(state.into_records(), fetcher.endpoint());
    Ok(HarvestRun {
        dataset,
        termination,
        pages,
    })
}

/// Run the fetch loop until the resolver is exhausted, a loop guard trips,
/// or cancellation is requested.
pub async fn harvest<F>(fetcher: &F, config: &HarvestConfig, mut cancel: CancelSignal) -> Harvest
where
    F: PageFetcher + ?Sized,
{
    let mut state = FetchState::new();
    let mut resolver = PaginationResolver::new();
    let delay = config.inter_request_delay();

    info!(
        endpoint = fetcher.endpoint(),
        max_pages = config.max_pages,
        delay_ms = config.inter_request_delay_ms,
        "Starting leaderboard harvest"
    );

    let termination = loop {
        if cancel.is_cancelled() {
            break Termination::Cancelled;
        }

        let Some(plan) = resolver.next_request(&state) else {
            let reason = resolver
                .exhaust_reason()
                .unwrap_or(ExhaustReason::FallbacksExhausted);
            break Termination::Exhausted(reason);
        };

        if state.page_count >= config.max_pages {
            break Termination::LoopGuard(LoopGuard::MaxPages);
        }

        let page_no = state.page_count + 1;
        debug!(
            page = page_no,
            state = %resolver.state(),
            shape = %plan.shape,
            params = ?plan.params,
            "Requesting page"
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = fetch_with_retry(fetcher, &plan.params, config) => Some(r),
        };
        let Some(result) = result else {
            break Termination::Cancelled;
        };
        state.page_count = page_no;

        match result {
            Ok(page) => {
                let page_ranks: Vec<u64> = page.records.iter().map(|r| r.rank).collect();
                let prior_max = state.max_rank();
                let advanced = page_ranks
                    .iter()
                    .any(|&r| prior_max.map_or(true, |m| r > m));
                log_page(page_no, &plan.shape.to_string(), &page);

                let PageResponse { records, hints } = page;
                state.record_hints(&hints);
                let outcome = state.accumulate(records);
                let stale_streak = state.record_outcome(outcome);

                info!(
                    page = page_no,
                    new = outcome.new_records(),
                    accumulated = state.len(),
                    "Page aggregated"
                );
                if !hints.is_empty() {
                    debug!(
                        page = page_no,
                        after = ?hints.after,
                        has_more = ?hints.has_more,
                        "Pagination metadata"
                    );
                }

                resolver.observe_page(
                    &plan,
                    PageObservation {
                        outcome,
                        advanced,
                        hints: &hints,
                        ranks: &page_ranks,
                    },
                );

                if !resolver.is_exhausted() && stale_streak >= config.max_consecutive_stale {
                    break Termination::LoopGuard(LoopGuard::ConsecutiveStale);
                }

                if page_no % PROGRESS_EVERY_PAGES == 0 {
                    info!(
                        pages = page_no,
                        accumulated = state.len(),
                        max_rank = ?state.max_rank(),
                        "Harvest progress"
                    );
                }
            }
            Err(err) => {
                let failures = state.record_failure();
                warn!(
                    page = page_no,
                    shape = %plan.shape,
                    kind = %err.kind,
                    consecutive_failures = failures,
                    error = %err,
                    "Page request failed"
                );
                resolver.observe_failure(&plan, &err);
            }
        }

        if resolver.is_exhausted() || delay.is_zero() {
            continue;
        }

        let slept = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = sleep(delay) => true,
        };
        if !slept {
            break Termination::Cancelled;
        }
    };

    report_termination(&termination, &state);

    Harvest {
        state,
        termination,
        final_pagination: resolver.state(),
    }
}

/// Retry network-level failures against the same parameters; everything else
/// goes straight back to the resolver.
async fn fetch_with_retry<F>(
    fetcher: &F,
    params: &[(&'static str, String)],
    config: &HarvestConfig,
) -> Result<PageResponse, FetchError>
where
    F: PageFetcher + ?Sized,
{
    let mut backoff = config.retry_backoff();
    let mut attempt = 0u32;

    loop {
        match fetcher.fetch(params).await {
            Err(e) if e.is_network() && attempt < config.max_network_retries => {
                attempt += 1;
                warn!(
                    attempt,
                    max_retries = config.max_network_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Network failure, retrying same request"
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
            other => return other,
        }
    }
}

// =============================================================================
// SHAPE SAMPLING
// =============================================================================

/// What a single page looked like, without its records.
#[derive(Debug, Clone, PartialEq)]
pub struct PageSummary {
    pub records: usize,
    pub first_rank: Option<u64>,
    pub last_rank: Option<u64>,
    pub hints: PaginationHints,
}

impl From<&PageResponse> for PageSummary {
    fn from(page: &PageResponse) -> Self {
        Self {
            records: page.records.len(),
            first_rank: page.first_rank(),
            last_rank: page.last_rank(),
            hints: page.hints.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ShapeSample {
    pub shape: ParamShape,
    pub params: QueryParams,
    pub result: Result<PageSummary, FetchError>,
}

/// Issue one request per parameter shape and report what each returned.
///
/// The bare page supplies the cursor (its `meta.after`, else its last rank)
/// and offset used by the other shapes. Stops after the bare request if it
/// fails or is empty.
pub async fn sample_shapes<F>(fetcher: &F, config: &HarvestConfig) -> Vec<ShapeSample>
where
    F: PageFetcher + ?Sized,
{
    let first = fetch_with_retry(fetcher, &[], config).await;
    let first = first.as_ref().map(PageSummary::from).map_err(Clone::clone);
    let mut samples = vec![ShapeSample {
        shape: ParamShape::Bare,
        params: Vec::new(),
        result: first.clone(),
    }];

    let Ok(first) = first else {
        return samples;
    };
    if first.records == 0 {
        return samples;
    }

    let cursor = first
        .hints
        .after
        .clone()
        .or_else(|| first.last_rank.map(|r| r.to_string()))
        .unwrap_or_default();
    let shapes: [(ParamShape, QueryParams); 4] = [
        (ParamShape::After, vec![("after", cursor.clone())]),
        (ParamShape::Offset, vec![("offset", first.records.to_string())]),
        (ParamShape::CursorAlias, vec![("cursor", cursor)]),
        (ParamShape::PageIndex, vec![("page", "2".to_string())]),
    ];

    for (shape, params) in shapes {
        sleep(config.inter_request_delay()).await;
        let result = fetch_with_retry(fetcher, &params, config)
            .await
            .map(|page| PageSummary::from(&page));
        match &result {
            Ok(summary) => info!(
                shape = %shape,
                records = summary.records,
                first_rank = ?summary.first_rank,
                last_rank = ?summary.last_rank,
                after = ?summary.hints.after,
                has_more = ?summary.hints.has_more,
                "Shape sampled"
            ),
            Err(e) => warn!(shape = %shape, error = %e, "Shape request failed"),
        }
        samples.push(ShapeSample {
            shape,
            params,
            result,
        });
    }
    samples
}

fn log_page(page_no: u32, shape: &str, page: &PageResponse) {
    match (page.records.first(), page.records.last()) {
        (Some(first), Some(last)) => info!(
            page = page_no,
            shape,
            records = page.records.len(),
            first_rank = page.first_rank(),
            last_rank = page.last_rank(),
            first_points = first.total_points,
            last_points = last.total_points,
            "Page fetched"
        ),
        _ => info!(page = page_no, shape, "Empty page received"),
    }
}

fn report_termination(termination: &Termination, state: &FetchState) {
    match termination {
        Termination::Exhausted(reason) => info!(
            %reason,
            pages = state.page_count,
            accumulated = state.len(),
            consecutive_failures = state.consecutive_failures,
            "Harvest finished cleanly: pagination exhausted"
        ),
        Termination::LoopGuard(LoopGuard::MaxPages) => warn!(
            pages = state.page_count,
            accumulated = state.len(),
            consecutive_failures = state.consecutive_failures,
            "Harvest stopped at the page limit; more data may exist"
        ),
        Termination::LoopGuard(guard) => warn!(
            %guard,
            pages = state.page_count,
            accumulated = state.len(),
            consecutive_failures = state.consecutive_failures,
            "Harvest stopped by loop guard"
        ),
        Termination::Cancelled => warn!(
            pages = state.page_count,
            accumulated = state.len(),
            consecutive_failures = state.consecutive_failures,
            "Harvest cut short by cancellation; keeping partial results"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::tests::ranks;
    use crate::fetcher::QueryParams;
    use crate::models::PaginationHints;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    type Responder = Box<
        dyn Fn(usize, &[(&'static str, String)]) -> Result<PageResponse, FetchError> + Send + Sync,
    >;

    /// Answers each request from the call index and the parameters.
    struct ScriptedFetcher {
        respond: Responder,
        calls: Mutex<Vec<QueryParams>>,
    }

    impl ScriptedFetcher {
        fn new<R>(respond: R) -> Self
        where
            R: Fn(usize, &[(&'static str, String)]) -> Result<PageResponse, FetchError>
                + Send
                + Sync
                + 'static,
        {
            Self {
                respond: Box::new(respond),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Hands out responses in order regardless of parameters.
        fn sequence(pages: Vec<Result<PageResponse, FetchError>>) -> Self {
            let queue = Mutex::new(VecDeque::from(pages));
            Self::new(move |_, _| {
                queue
                    .lock()
                    .pop_front()
                    .unwrap_or_else(|| Err(FetchError::decode("script exhausted")))
            })
        }

        fn calls(&self) -> Vec<QueryParams> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        fn endpoint(&self) -> &str {
            "https://mock.test/leaderboard"
        }

        async fn fetch(
            &self,
            params: &[(&'static str, String)],
        ) -> Result<PageResponse, FetchError> {
            let idx = {
                let mut calls = self.calls.lock();
                calls.push(params.to_vec());
                calls.len() - 1
            };
            (self.respond)(idx, params)
        }
    }

    fn page(
        range: std::ops::RangeInclusive<u64>,
        after: Option<&str>,
        has_more: Option<bool>,
    ) -> Result<PageResponse, FetchError> {
        Ok(PageResponse {
            records: ranks(range),
            hints: PaginationHints {
                after: after.map(str::to_string),
                has_more,
            },
        })
    }

    fn empty() -> Result<PageResponse, FetchError> {
        Ok(PageResponse::default())
    }

    fn param<'a>(params: &'a [(&'static str, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    fn test_config() -> HarvestConfig {
        HarvestConfig {
            base_url: "https://mock.test/leaderboard".into(),
            inter_request_delay_ms: 0,
            retry_backoff_ms: 1,
            ..HarvestConfig::default()
        }
    }

    #[tokio::test]
    async fn test_overlapping_cursor_pages() {
        let fetcher = ScriptedFetcher::new(|_, params| match param(params, "after") {
            None if params.is_empty() => page(1..=100, Some("100"), Some(true)),
            Some("100") => page(100..=150, None, Some(false)),
            _ => empty(),
        });

        let run = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 150);
        let ranks: Vec<u64> = run.dataset.records.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, (1..=150).collect::<Vec<_>>());
        assert_eq!(run.termination, Termination::Exhausted(ExhaustReason::EndSignaled));
        assert!(run.termination.is_clean());
        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(run.dataset.source, "https://mock.test/leaderboard");
    }

    #[tokio::test]
    async fn test_server_ignoring_cursor_terminates() {
        let fetcher = ScriptedFetcher::new(|_, _| page(1..=50, Some("50"), Some(true)));

        let run = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 50);
        assert_eq!(
            run.termination,
            Termination::Exhausted(ExhaustReason::FallbacksExhausted)
        );
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[0].is_empty());
        assert_eq!(param(&calls[1], "after"), Some("50"));
        assert_eq!(param(&calls[2], "offset"), Some("50"));
        assert_eq!(param(&calls[3], "cursor"), Some("50"));
        assert_eq!(param(&calls[4], "page"), Some("2"));
    }

    #[tokio::test]
    async fn test_stale_guard_trips_before_fallbacks_run_out() {
        let fetcher = ScriptedFetcher::new(|_, _| page(1..=50, Some("50"), None));
        let config = HarvestConfig {
            max_consecutive_stale: 2,
            ..test_config()
        };

        let harvest = harvest(&fetcher, &config, CancelSignal::never()).await;

        assert_eq!(
            harvest.termination,
            Termination::LoopGuard(LoopGuard::ConsecutiveStale)
        );
        assert!(harvest.termination.is_clean());
        assert_eq!(harvest.state.len(), 50);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_terminates_at_empty_page() {
        let script = vec![
            page(1..=10, None, None),
            page(5..=15, None, None),
            page(16..=20, Some("20"), None),
            page(16..=20, Some("20"), None),
            page(21..=30, None, None),
            empty(),
        ];
        let len = script.len();
        let fetcher = ScriptedFetcher::sequence(script);

        let harvest = harvest(&fetcher, &test_config(), CancelSignal::never()).await;

        assert!(fetcher.calls().len() <= len);
        assert_eq!(harvest.state.page_count as usize, fetcher.calls().len());
        assert!(harvest.termination.is_clean());
        assert_eq!(harvest.state.records().len(), harvest.state.len());
    }

    #[tokio::test]
    async fn test_cursor_sequence_ending_empty() {
        let fetcher = ScriptedFetcher::sequence(vec![
            page(1..=10, Some("10"), Some(true)),
            page(11..=20, Some("20"), Some(true)),
            page(21..=25, Some("25"), Some(true)),
            empty(),
        ]);

        let harvest = harvest(&fetcher, &test_config(), CancelSignal::never()).await;

        assert_eq!(harvest.termination, Termination::Exhausted(ExhaustReason::EmptyPage));
        assert_eq!(fetcher.calls().len(), 4);
        assert_eq!(harvest.state.len(), 25);
        assert!(matches!(harvest.final_pagination, PaginationState::Exhausted(_)));
    }

    #[tokio::test]
    async fn test_network_errors_retry_same_request() {
        let fetcher = ScriptedFetcher::new(|idx, params| match idx {
            0 => page(1..=10, Some("10"), Some(true)),
            1 | 2 => Err(FetchError::network("connection reset")),
            _ if param(params, "after") == Some("10") => page(11..=12, None, Some(false)),
            _ => empty(),
        });

        let run = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 12);
        let calls = fetcher.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1], calls[2]);
        assert_eq!(calls[2], calls[3]);
        // retries happen inside one logical page request
        assert_eq!(run.pages, 2);
    }

    #[tokio::test]
    async fn test_network_retries_exhausted_falls_back() {
        let fetcher = ScriptedFetcher::new(|_, params| {
            if params.is_empty() {
                page(1..=10, Some("10"), Some(true))
            } else if param(params, "after").is_some() {
                Err(FetchError::network("timeout"))
            } else if param(params, "offset") == Some("10") {
                page(11..=20, None, None)
            } else {
                empty()
            }
        });
        let config = HarvestConfig {
            max_network_retries: 1,
            ..test_config()
        };

        let run = collect_leaderboard(&fetcher, &config, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 20);
        let after_calls = fetcher
            .calls()
            .iter()
            .filter(|c| param(c, "after").is_some())
            .count();
        assert_eq!(after_calls, 2);
    }

    #[tokio::test]
    async fn test_http_error_triggers_fallback_probing() {
        let fetcher = ScriptedFetcher::new(|_, params| {
            if params.is_empty() {
                return page(1..=10, Some("10"), Some(true));
            }
            match (param(params, "after"), param(params, "offset")) {
                (Some(_), _) => Err(FetchError::http_status(500, "internal error")),
                (_, Some("10")) => page(11..=20, None, None),
                _ => empty(),
            }
        });

        let run = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 20);
        assert_eq!(run.termination, Termination::Exhausted(ExhaustReason::EmptyPage));
        let calls = fetcher.calls();
        assert_eq!(param(calls.last().unwrap(), "offset"), Some("20"));
    }

    #[tokio::test]
    async fn test_decode_error_moves_to_next_shape() {
        let fetcher = ScriptedFetcher::new(|_, params| {
            if params.is_empty() {
                page(1..=10, None, None)
            } else if param(params, "offset").is_some() {
                Err(FetchError::decode("unexpected body"))
            } else if param(params, "page") == Some("2") {
                page(11..=20, None, Some(false))
            } else {
                empty()
            }
        });

        let run = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.dataset.total_entries, 20);
        assert_eq!(run.termination, Termination::Exhausted(ExhaustReason::EndSignaled));
    }

    #[tokio::test]
    async fn test_no_records_on_first_page_is_fatal() {
        let fetcher =
            ScriptedFetcher::new(|_, _| Err(FetchError::http_status(503, "unavailable")));

        let err = collect_leaderboard(&fetcher, &test_config(), CancelSignal::never())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HarvestError::NoRecords {
                termination: Termination::Exhausted(ExhaustReason::FallbacksExhausted),
                pages: 3,
            }
        );
        // bare, offset=0, page=1 (cursor alias has nothing to alias)
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_max_pages_guard() {
        let fetcher = ScriptedFetcher::new(|idx, _| {
            let start = idx as u64 * 10 + 1;
            let end = start + 9;
            page(start..=end, Some(end.to_string().as_str()), Some(true))
        });
        let config = HarvestConfig {
            max_pages: 3,
            ..test_config()
        };

        let run = collect_leaderboard(&fetcher, &config, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::LoopGuard(LoopGuard::MaxPages));
        assert_eq!(run.dataset.total_entries, 30);
        assert_eq!(fetcher.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_between_pages_keeps_partial_results() {
        let (handle, signal) = CancelHandle::new();
        let fetcher = ScriptedFetcher::new(move |idx, _| {
            if idx == 1 {
                handle.cancel();
            }
            let start = idx as u64 * 10 + 1;
            let end = start + 9;
            page(start..=end, Some(end.to_string().as_str()), Some(true))
        });

        let run = collect_leaderboard(&fetcher, &test_config(), signal)
            .await
            .unwrap();

        assert_eq!(run.termination, Termination::Cancelled);
        assert!(!run.termination.is_clean());
        assert_eq!(run.dataset.total_entries, 20);
        assert_eq!(fetcher.calls().len(), 2);
    }

    /// Serves one page, then never answers.
    struct StallingFetcher;

    #[async_trait]
    impl PageFetcher for StallingFetcher {
        fn endpoint(&self) -> &str {
            "https://mock.test/leaderboard"
        }

        async fn fetch(
            &self,
            params: &[(&'static str, String)],
        ) -> Result<PageResponse, FetchError> {
            if params.is_empty() {
                return page(1..=10, Some("10"), Some(true));
            }
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_request() {
        let (handle, signal) = CancelHandle::new();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let run = tokio::time::timeout(
            Duration::from_secs(5),
            collect_leaderboard(&StallingFetcher, &test_config(), signal),
        )
        .await
        .expect("cancellation should stop the harvest")
        .unwrap();

        assert_eq!(run.termination, Termination::Cancelled);
        assert_eq!(run.dataset.total_entries, 10);
        assert_eq!(run.pages, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_inter_request_delay() {
        let (handle, signal) = CancelHandle::new();
        let fetcher = ScriptedFetcher::new(move |idx, _| {
            handle.cancel();
            let start = idx as u64 * 10 + 1;
            page(start..=start + 9, Some("x"), Some(true))
        });
        let config = HarvestConfig {
            inter_request_delay_ms: 60_000,
            ..test_config()
        };

        let harvest = tokio::time::timeout(
            Duration::from_secs(5),
            harvest(&fetcher, &config, signal),
        )
        .await
        .unwrap();

        assert_eq!(harvest.termination, Termination::Cancelled);
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_shapes_reports_each_shape() {
        let fetcher = ScriptedFetcher::new(|_, params| match param(params, "offset") {
            Some("10") => page(11..=20, None, Some(true)),
            _ => page(1..=10, Some("10"), Some(true)),
        });

        let samples = sample_shapes(&fetcher, &test_config()).await;

        let shapes: Vec<ParamShape> = samples.iter().map(|s| s.shape).collect();
        assert_eq!(
            shapes,
            vec![
                ParamShape::Bare,
                ParamShape::After,
                ParamShape::Offset,
                ParamShape::CursorAlias,
                ParamShape::PageIndex,
            ]
        );
        assert_eq!(samples[1].params, vec![("after", "10".to_string())]);
        let offset = samples[2].result.as_ref().unwrap();
        assert_eq!(offset.first_rank, Some(11));
        assert_eq!(offset.last_rank, Some(20));
        let after = samples[1].result.as_ref().unwrap();
        assert_eq!(after.first_rank, Some(1));
        assert_eq!(fetcher.calls().len(), 5);
    }

    #[tokio::test]
    async fn test_sample_shapes_uses_last_rank_without_cursor() {
        let fetcher = ScriptedFetcher::new(|_, _| page(1..=7, None, None));

        let samples = sample_shapes(&fetcher, &test_config()).await;

        assert_eq!(samples[1].params, vec![("after", "7".to_string())]);
        assert_eq!(samples[3].params, vec![("cursor", "7".to_string())]);
    }

    #[tokio::test]
    async fn test_sample_shapes_stops_when_bare_request_fails() {
        let fetcher = ScriptedFetcher::new(|_, _| Err(FetchError::http_status(404, "not found")));

        let samples = sample_shapes(&fetcher, &test_config()).await;

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].result.as_ref().unwrap_err().status, Some(404));
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_termination_report_counts_failures() {
        let fetcher = ScriptedFetcher::new(|idx, _| match idx {
            0 => page(1..=10, Some("10"), Some(true)),
            _ => Err(FetchError::decode("garbled")),
        });

        let harvest = harvest(&fetcher, &test_config(), CancelSignal::never()).await;

        // after, offset, cursor and page all fail
        assert_eq!(
            harvest.termination,
            Termination::Exhausted(ExhaustReason::FallbacksExhausted)
        );
        assert_eq!(harvest.state.consecutive_failures, 4);
    }

    #[tokio::test]
    async fn test_cancel_signal_never_fires() {
        let mut signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}
