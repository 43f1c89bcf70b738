//! Deterministic product and counterfactual-firm sampling
//!
//! Candidates are always sorted before sampling and every draw uses a fresh
//! `StdRng` seeded with the configured seed, so a given store state and seal
//! event yields the same sample no matter which worker processes it or in
//! which order events complete.

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::Arc;

use super::db::{PanelStore, Relation};
use super::error::PanelError;
use super::query::{apply_criteria, Ident, Order, Predicate, QueryCriterion, SelectQuery};
use super::types::{FirmId, ProductId, SealChangeEvent};
use super::windows::{date_to_unix, UNIX_WEEK};

/// Up to `n` elements of `candidates`, chosen reproducibly from `seed`
///
/// Duplicates are removed first. When at most `n` candidates remain all of
/// them are returned; otherwise the sample keeps the candidates' sort order.
pub fn deterministic_sample<T: Ord>(mut candidates: Vec<T>, n: usize, seed: u64) -> Vec<T> {
    candidates.sort();
    candidates.dedup();
    if candidates.len() <= n {
        return candidates;
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, candidates.len(), n).into_vec();
    picked.sort_unstable();

    let mut picked = picked.into_iter().peekable();
    candidates
        .into_iter()
        .enumerate()
        .filter_map(|(i, candidate)| {
            if picked.peek() == Some(&i) {
                picked.next();
                Some(candidate)
            } else {
                None
            }
        })
        .collect()
}

pub struct SamplingEngine {
    store: PanelStore,
    /// Half-width in weeks of the window around the seal date used for product queries
    window_weeks: u32,
    criteria: Vec<Arc<dyn QueryCriterion>>,
    allowed_firms: Option<Arc<HashSet<FirmId>>>,
}

impl SamplingEngine {
    pub fn new(store: PanelStore, window_weeks: u32) -> Self {
        Self { store, window_weeks, criteria: Vec::new(), allowed_firms: None }
    }

    /// Criteria applied to every query this engine builds
    pub fn with_criteria(mut self, criteria: Vec<Arc<dyn QueryCriterion>>) -> Self {
        self.criteria = criteria;
        self
    }

    /// Additionally require counterfactual firms to be in this list
    pub fn with_allowed_firms(mut self, allowed: Arc<HashSet<FirmId>>) -> Self {
        self.allowed_firms = Some(allowed);
        self
    }

    /// Unix range `[seal - w weeks, seal + w weeks]` around the seal date
    pub fn window(&self, seal_date: NaiveDate) -> (i64, i64) {
        let seal = date_to_unix(seal_date);
        let half = self.window_weeks as i64 * UNIX_WEEK;
        (seal - half, seal + half)
    }

    /// Products offered by `firm` within the window, at most `n` of them
    ///
    /// An empty result is valid: the firm simply had nothing listed.
    pub fn sample_products(
        &self,
        firm: &str,
        seal_date: NaiveDate,
        n: usize,
        seed: u64,
    ) -> Result<Vec<ProductId>, PanelError> {
        let (from, to) = self.window(seal_date);
        let query = SelectQuery::from(Relation::Offers.ident())
            .distinct()
            .column(Ident::from_static("produkt_id"))
            .filter(Predicate::Eq(Ident::from_static("haendler_bez"), firm.to_string().into()))
            .filter(Predicate::Overlaps {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                from,
                to,
            });
        let query = apply_criteria(query, &self.criteria);

        let candidates = self.store.query_i64s(&query.build())?;
        let pool = candidates.len();
        let sample = deterministic_sample(candidates, n, seed);
        log::debug!("   ├─ {} of {} offered products sampled for '{}'", sample.len(), pool, firm);
        Ok(sample)
    }

    /// Most clicked products of `firm` within the window, click count descending
    pub fn top_clicked_products(
        &self,
        firm: &str,
        seal_date: NaiveDate,
        limit: usize,
    ) -> Result<Vec<ProductId>, PanelError> {
        let (from, to) = self.window(seal_date);
        let query = SelectQuery::from(Relation::Clicks.ident())
            .column(Ident::from_static("produkt_id"))
            .count_as(Ident::from_static("total_clicks"))
            .filter(Predicate::Eq(Ident::from_static("haendler_bez"), firm.to_string().into()))
            .filter(Predicate::Between(Ident::from_static("timestamp"), from, to));
        let query = apply_criteria(query, &self.criteria)
            .group_by(Ident::from_static("produkt_id"))
            .order_by(Ident::from_static("total_clicks"), Order::Desc)
            .order_by(Ident::from_static("produkt_id"), Order::Asc)
            .limit(limit as u64);

        self.store.query_i64s(&query.build())
    }

    /// Comparison firms offering `product` at the seal instant
    ///
    /// Every firm in `seal_firms` is excluded, not just the event's own firm.
    /// When an allowed-firm list is configured, only listed firms qualify.
    pub fn sample_counterfactual_firms(
        &self,
        product: ProductId,
        seal_date: NaiveDate,
        seal_firms: &HashSet<FirmId>,
        max_n: usize,
        seed: u64,
    ) -> Result<Vec<FirmId>, PanelError> {
        let query = SelectQuery::from(Relation::Offers.ident())
            .distinct()
            .column(Ident::from_static("haendler_bez"))
            .filter(Predicate::Eq(Ident::from_static("produkt_id"), product.into()))
            .filter(Predicate::ActiveAt {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                at: date_to_unix(seal_date),
            });
        let query = apply_criteria(query, &self.criteria);

        let eligible: Vec<FirmId> = self
            .store
            .query_strings(&query.build())?
            .into_iter()
            .filter(|firm| !seal_firms.contains(firm))
            .filter(|firm| self.allowed_firms.as_ref().map_or(true, |allowed| allowed.contains(firm)))
            .collect();

        Ok(deterministic_sample(eligible, max_n, seed))
    }
}

/// Strategy that picks the candidate products of one seal event
pub trait ProductSelector: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, engine: &SamplingEngine, event: &SealChangeEvent) -> Result<Vec<ProductId>, PanelError>;
}

/// Seeded random sample of the firm's offered products
#[derive(Debug, Clone, Copy)]
pub struct RandomProductSelector {
    pub sample_size: usize,
    pub seed: u64,
}

impl ProductSelector for RandomProductSelector {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, engine: &SamplingEngine, event: &SealChangeEvent) -> Result<Vec<ProductId>, PanelError> {
        engine.sample_products(&event.firm, event.seal_date, self.sample_size, self.seed)
    }
}

/// The firm's most clicked products around the seal date
#[derive(Debug, Clone, Copy)]
pub struct TopClicksProductSelector {
    pub limit: usize,
}

impl ProductSelector for TopClicksProductSelector {
    fn name(&self) -> &'static str {
        "top_clicks"
    }

    fn select(&self, engine: &SamplingEngine, event: &SealChangeEvent) -> Result<Vec<ProductId>, PanelError> {
        engine.top_clicked_products(&event.firm, event.seal_date, self.limit)
    }
}
