//! Pagination Strategy Resolver
//!
//! The upstream API only partially documents its pagination contract, so
//! which scheme is in effect is tracked as explicit state:
//!
//! - `PRIMARY_CURSOR`: bare first request, then `after=<meta.after>`
//! - `FALLBACK_PROBING`: ordered alternative shapes (`offset`, `cursor`,
//!   `page`), sticking with the first one that moves past the highest rank
//! - `EXHAUSTED`: terminal
//!
//! New fallback shapes only need an entry in `FALLBACK_SHAPES` and a branch
//! in `fallback_params`.

use crate::aggregator::{AggregationOutcome, FetchState};
use crate::fetcher::{FetchError, QueryParams};
use crate::models::PaginationHints;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// No parameters
    Bare,
    /// `after=<cursor>`
    After,
    /// `offset=<records accumulated>`
    Offset,
    /// `cursor=<cursor>`
    CursorAlias,
    /// `page=<n>`
    PageIndex,
}

impl std::fmt::Display for ParamShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bare => write!(f, "bare"),
            Self::After => write!(f, "after"),
            Self::Offset => write!(f, "offset"),
            Self::CursorAlias => write!(f, "cursor"),
            Self::PageIndex => write!(f, "page"),
        }
    }
}

/// Probe order once the primary cursor stops working.
pub const FALLBACK_SHAPES: [ParamShape; 3] = [
    ParamShape::Offset,
    ParamShape::CursorAlias,
    ParamShape::PageIndex,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPlan {
    pub shape: ParamShape,
    pub params: QueryParams,
}

impl RequestPlan {
    fn new(shape: ParamShape, params: QueryParams) -> Self {
        Self { shape, params }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// A request came back with zero records
    EmptyPage,
    /// No cursor and `hasMore: false`
    EndSignaled,
    /// Every fallback shape failed to make progress
    FallbacksExhausted,
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPage => write!(f, "empty_page"),
            Self::EndSignaled => write!(f, "end_signaled"),
            Self::FallbacksExhausted => write!(f, "fallbacks_exhausted"),
        }
    }
}

/// Why the resolver left `PRIMARY_CURSOR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTrigger {
    CursorMissing,
    NoProgress,
    IdenticalPages,
    RequestFailed,
}

impl std::fmt::Display for FallbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CursorMissing => write!(f, "cursor_missing"),
            Self::NoProgress => write!(f, "no_progress"),
            Self::IdenticalPages => write!(f, "identical_pages"),
            Self::RequestFailed => write!(f, "request_failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    PrimaryCursor,
    FallbackProbing {
        /// Index into `FALLBACK_SHAPES` of the shape to try next
        shape_index: usize,
        /// Shapes tried since the last request that made progress
        attempts: usize,
    },
    Exhausted(ExhaustReason),
}

impl std::fmt::Display for PaginationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryCursor => write!(f, "PRIMARY_CURSOR"),
            Self::FallbackProbing { .. } => write!(f, "FALLBACK_PROBING"),
            Self::Exhausted(_) => write!(f, "EXHAUSTED"),
        }
    }
}

/// What the driver learned from one successful page.
#[derive(Debug, Clone, Copy)]
pub struct PageObservation<'a> {
    pub outcome: AggregationOutcome,
    /// Page held a rank above everything accumulated before it
    pub advanced: bool,
    pub hints: &'a PaginationHints,
    /// Ranks in page order, for spotting a server that echoes one page
    pub ranks: &'a [u64],
}

#[derive(Debug)]
pub struct PaginationResolver {
    state: PaginationState,
    requests_observed: u32,
    pages_advanced: u32,
    last_primary_ranks: Option<Vec<u64>>,
}

impl Default for PaginationResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationResolver {
    pub fn new() -> Self {
        Self {
            state: PaginationState::PrimaryCursor,
            requests_observed: 0,
            pages_advanced: 0,
            last_primary_ranks: None,
        }
    }

    pub fn state(&self) -> PaginationState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, PaginationState::Exhausted(_))
    }

    pub fn exhaust_reason(&self) -> Option<ExhaustReason> {
        match self.state {
            PaginationState::Exhausted(reason) => Some(reason),
            _ => None,
        }
    }

    /// Parameters for the next request, or `None` once exhausted.
    ///
    /// Fallback shapes that cannot be built yet (e.g. `cursor` before any
    /// cursor was seen) are skipped and count as tried.
    pub fn next_request(&mut self, fetch: &FetchState) -> Option<RequestPlan> {
        loop {
            match self.state {
                PaginationState::Exhausted(_) => return None,
                PaginationState::PrimaryCursor => {
                    if self.requests_observed == 0 {
                        return Some(RequestPlan::new(ParamShape::Bare, Vec::new()));
                    }
                    match &fetch.cursor {
                        Some(after) => {
                            return Some(RequestPlan::new(
                                ParamShape::After,
                                vec![("after", after.clone())],
                            ))
                        }
                        None => self.enter_fallback(FallbackTrigger::CursorMissing),
                    }
                }
                PaginationState::FallbackProbing { shape_index, .. } => {
                    let shape = FALLBACK_SHAPES[shape_index];
                    match self.fallback_params(shape, fetch) {
                        Some(params) => return Some(RequestPlan::new(shape, params)),
                        None => {
                            debug!(shape = %shape, "Fallback shape not applicable yet, skipping");
                            self.advance_fallback();
                        }
                    }
                }
            }
        }
    }

    fn fallback_params(&self, shape: ParamShape, fetch: &FetchState) -> Option<QueryParams> {
        match shape {
            ParamShape::Offset => Some(vec![("offset", fetch.len().to_string())]),
            ParamShape::CursorAlias => fetch
                .cursor
                .as_ref()
                .map(|c| vec![("cursor", c.clone())]),
            ParamShape::PageIndex => {
                Some(vec![("page", (self.pages_advanced + 1).to_string())])
            }
            ParamShape::Bare | ParamShape::After => None,
        }
    }

    /// Feed back a page that parsed successfully.
    pub fn observe_page(&mut self, plan: &RequestPlan, obs: PageObservation<'_>) {
        self.requests_observed += 1;
        if obs.advanced {
            self.pages_advanced += 1;
        }

        if obs.outcome == AggregationOutcome::Empty {
            self.exhaust(ExhaustReason::EmptyPage);
            return;
        }

        match self.state {
            PaginationState::Exhausted(_) => {}
            PaginationState::PrimaryCursor => {
                let identical = self.last_primary_ranks.as_deref() == Some(obs.ranks);
                self.last_primary_ranks = Some(obs.ranks.to_vec());

                if identical {
                    self.enter_fallback(FallbackTrigger::IdenticalPages);
                } else if obs.outcome == AggregationOutcome::Duplicate
                    && obs.hints.has_more == Some(true)
                {
                    self.enter_fallback(FallbackTrigger::NoProgress);
                } else if obs.hints.after.is_some() {
                    // stay on the primary cursor
                } else if obs.hints.has_more == Some(false) {
                    self.exhaust(ExhaustReason::EndSignaled);
                } else {
                    self.enter_fallback(FallbackTrigger::CursorMissing);
                }
            }
            PaginationState::FallbackProbing { shape_index, .. } => {
                if obs.advanced {
                    debug!(shape = %plan.shape, "Fallback shape advanced, keeping it");
                    self.state = PaginationState::FallbackProbing {
                        shape_index,
                        attempts: 0,
                    };
                    if obs.hints.after.is_none() && obs.hints.has_more == Some(false) {
                        self.exhaust(ExhaustReason::EndSignaled);
                    }
                } else {
                    debug!(
                        shape = %plan.shape,
                        outcome = ?obs.outcome,
                        "Fallback shape made no progress"
                    );
                    self.advance_fallback();
                }
            }
        }
    }

    /// Feed back a request that failed after any network retries.
    pub fn observe_failure(&mut self, plan: &RequestPlan, err: &FetchError) {
        self.requests_observed += 1;
        match self.state {
            PaginationState::Exhausted(_) => {}
            PaginationState::PrimaryCursor => {
                debug!(shape = %plan.shape, error = %err, "Primary request failed");
                self.enter_fallback(FallbackTrigger::RequestFailed);
            }
            PaginationState::FallbackProbing { .. } => {
                debug!(shape = %plan.shape, error = %err, "Fallback request failed");
                self.advance_fallback();
            }
        }
    }

    fn enter_fallback(&mut self, trigger: FallbackTrigger) {
        warn!(
            trigger = %trigger,
            from = %self.state,
            "Primary cursor not advancing, probing fallback pagination shapes"
        );
        self.state = PaginationState::FallbackProbing {
            shape_index: 0,
            attempts: 0,
        };
    }

    fn advance_fallback(&mut self) {
        if let PaginationState::FallbackProbing {
            shape_index,
            attempts,
        } = self.state
        {
            let attempts = attempts + 1;
            if attempts >= FALLBACK_SHAPES.len() {
                self.exhaust(ExhaustReason::FallbacksExhausted);
            } else {
                self.state = PaginationState::FallbackProbing {
                    shape_index: (shape_index + 1) % FALLBACK_SHAPES.len(),
                    attempts,
                };
            }
        }
    }

    fn exhaust(&mut self, reason: ExhaustReason) {
        debug!(from = %self.state, reason = %reason, "Pagination exhausted");
        self.state = PaginationState::Exhausted(reason);
    }
}
