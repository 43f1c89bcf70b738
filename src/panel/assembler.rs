//! Per-event panel assembly
//!
//! For one seal event the assembler loads the event's windows, picks candidate
//! products, admits the persistently listed ones, samples counterfactual
//! firms per admitted product, and collects the offer spells each
//! (product, firm) task needs. The result is an in-memory [`EventPlan`]; the
//! store is not touched again once the plan exists, so rows can be emitted
//! while another event is being prepared.
//!
//! Task order inside a plan: product outer loop, the seal firm first, then
//! its counterfactual firms.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::config::{PanelConfig, ProductSelection};
use super::continuity::ContinuityFilter;
use super::db::{PanelStore, Relation};
use super::error::PanelError;
use super::ingestion::{DataIngestionManager, PartitionSource, WindowLoad};
use super::query::{ExcludeScraperIps, Ident, Predicate, QueryCriterion, SelectQuery};
use super::reclaim::{MemoryProbe, RecoveryPause};
use super::sampling::{ProductSelector, RandomProductSelector, SamplingEngine, TopClicksProductSelector};
use super::seal_events::SealFirmSet;
use super::state::ProcessedFirmSet;
use super::types::{FirmId, ObservationRow, ProductId, SealChangeEvent};
use super::windows::{observation_bounds, running_var, unix_from_running_var, WindowResolver};

#[derive(Debug, Clone, Copy)]
pub struct AssemblerSettings {
    pub resolver: WindowResolver,
    pub continuity_weeks: u32,
    pub counterfactual_sample_size: usize,
    pub seed: u64,
}

impl AssemblerSettings {
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            resolver: config.window_resolver(),
            continuity_weeks: config.continuity_weeks,
            counterfactual_sample_size: config.counterfactual_sample_size,
            seed: config.sampler_seed,
        }
    }
}

/// One (product, firm) pair and its offer spells around the seal date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelTask {
    pub product_id: ProductId,
    pub firm_id: FirmId,
    pub treatment_flag: u8,
    /// `[start, end)` spells overlapping the observation bound
    pub spells: Vec<(i64, i64)>,
}

impl PanelTask {
    /// Weeks with an active spell, restricted to the ±26-week observation bound
    pub fn offered_weeks(&self, seal_unix: i64) -> Vec<i64> {
        let (low, high) = observation_bounds(seal_unix);
        let mut weeks = BTreeSet::new();
        for &(start, end) in &self.spells {
            if end <= start {
                continue;
            }
            let first = running_var(start).max(low);
            let last = running_var(end - 1).min(high);
            weeks.extend(first..=last);
        }
        weeks.into_iter().collect()
    }

    pub fn rows(&self, seal_unix: i64) -> Vec<ObservationRow> {
        self.offered_weeks(seal_unix)
            .into_iter()
            .map(|week| ObservationRow {
                product_id: self.product_id,
                firm_id: self.firm_id.clone(),
                week_running_var: week,
                treatment_flag: self.treatment_flag,
            })
            .collect()
    }
}

/// Everything needed to emit one event's rows
#[derive(Debug, Clone)]
pub struct EventPlan {
    pub event: SealChangeEvent,
    pub window: WindowLoad,
    pub candidates: usize,
    pub admitted: usize,
    pub tasks: Vec<PanelTask>,
}

impl EventPlan {
    /// Rows grouped per task, in task order
    pub fn task_rows(&self) -> impl Iterator<Item = Vec<ObservationRow>> + '_ {
        let seal_unix = self.event.seal_unix();
        self.tasks.iter().map(move |task| task.rows(seal_unix))
    }

    pub fn rows(&self) -> Vec<ObservationRow> {
        self.task_rows().flatten().collect()
    }
}

pub struct PanelAssembler {
    ingestion: DataIngestionManager,
    sampler: SamplingEngine,
    continuity: ContinuityFilter,
    selector: Box<dyn ProductSelector>,
    seal_firms: Arc<SealFirmSet>,
    settings: AssemblerSettings,
}

impl PanelAssembler {
    pub fn new(
        ingestion: DataIngestionManager,
        sampler: SamplingEngine,
        continuity: ContinuityFilter,
        selector: Box<dyn ProductSelector>,
        seal_firms: Arc<SealFirmSet>,
        settings: AssemblerSettings,
    ) -> Self {
        Self { ingestion, sampler, continuity, selector, seal_firms, settings }
    }

    /// Wire up every component from the run configuration
    ///
    /// `allowed_firms` is only consulted when counterfactuals are required to
    /// be on the allowed list.
    pub fn from_config(
        config: &PanelConfig,
        store: PanelStore,
        seal_firms: Arc<SealFirmSet>,
        allowed_firms: Option<Arc<HashSet<FirmId>>>,
        probe: Arc<dyn MemoryProbe>,
        cancel: CancellationToken,
    ) -> Self {
        let recovery = RecoveryPause::new(config.recovery, probe, cancel);
        let ingestion = DataIngestionManager::new(
            store.clone(),
            PartitionSource::from_config(config),
            config.offer_policy,
            config.click_policy,
            recovery,
        );

        let mut criteria: Vec<Arc<dyn QueryCriterion>> = Vec::new();
        if config.exclude_scraper_clicks && config.scraper_ips_path.is_some() {
            criteria.push(Arc::new(ExcludeScraperIps));
        }
        let mut sampler = SamplingEngine::new(store.clone(), config.continuity_weeks).with_criteria(criteria);
        if config.require_allowed_counterfactuals {
            match allowed_firms {
                Some(allowed) => sampler = sampler.with_allowed_firms(allowed),
                None => log::warn!("⚠️  Allowed counterfactuals required but no allowed-firm list loaded"),
            }
        }

        let selector: Box<dyn ProductSelector> = match config.product_selection {
            ProductSelection::TopClicks => Box::new(TopClicksProductSelector { limit: config.top_products_by_clicks }),
            ProductSelection::Random => Box::new(RandomProductSelector {
                sample_size: config.product_sample_size,
                seed: config.sampler_seed,
            }),
        };

        Self::new(
            ingestion,
            sampler,
            ContinuityFilter::new(store, config.continuity_missing_weeks_allowed),
            selector,
            seal_firms,
            AssemblerSettings::from_config(config),
        )
    }

    pub fn ingestion(&self) -> &DataIngestionManager {
        &self.ingestion
    }

    pub fn store(&self) -> &PanelStore {
        self.ingestion.store()
    }

    pub fn seal_firms(&self) -> &SealFirmSet {
        &self.seal_firms
    }

    /// Spells of `(product, firm)` that can contribute observation weeks
    fn task_spells(&self, product: ProductId, firm: &str, seal_unix: i64) -> Result<Vec<(i64, i64)>, PanelError> {
        let (low, high) = observation_bounds(seal_unix);
        let query = SelectQuery::from(Relation::Offers.ident())
            .column(Ident::from_static("dtimebegin"))
            .column(Ident::from_static("dtimeend"))
            .filter(Predicate::Eq(Ident::from_static("produkt_id"), product.into()))
            .filter(Predicate::Eq(Ident::from_static("haendler_bez"), firm.to_string().into()))
            .filter(Predicate::Overlaps {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                from: unix_from_running_var(low),
                to: unix_from_running_var(high + 1),
            })
            .build();
        self.store()
            .query_map(&query, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
    }

    fn task(&self, product: ProductId, firm: &str, treatment_flag: u8, seal_unix: i64) -> Result<PanelTask, PanelError> {
        Ok(PanelTask {
            product_id: product,
            firm_id: firm.to_string(),
            treatment_flag,
            spells: self.task_spells(product, firm, seal_unix)?,
        })
    }

    /// Load the event's windows and build its task list
    ///
    /// Blocking; needs exclusive use of the store until it returns.
    pub fn prepare(&self, event: &SealChangeEvent) -> Result<EventPlan, PanelError> {
        log::info!("🔧 Preparing seal event '{}' ({})", event.firm, event.seal_date_str());

        let resolver = &self.settings.resolver;
        let window = self.ingestion.prepare_event_windows(
            &resolver.offer_partitions(event.seal_date),
            &resolver.click_partitions(event.seal_date),
        )?;

        let candidates = self.selector.select(&self.sampler, event)?;
        let mut admitted = Vec::new();
        for &product in &candidates {
            if self.continuity.is_continuously_offered(
                product,
                &event.firm,
                event.seal_date,
                self.settings.continuity_weeks,
            )? {
                admitted.push(product);
            }
        }

        let seal_unix = event.seal_unix();
        let mut tasks = Vec::new();
        for &product in &admitted {
            tasks.push(self.task(product, &event.firm, 1, seal_unix)?);

            let counterfactuals = self.sampler.sample_counterfactual_firms(
                product,
                event.seal_date,
                &self.seal_firms,
                self.settings.counterfactual_sample_size,
                self.settings.seed,
            )?;
            // The treated firm never serves as its own control
            for firm in counterfactuals.iter().filter(|firm| **firm != event.firm) {
                tasks.push(self.task(product, firm, 0, seal_unix)?);
            }
        }

        log::info!(
            "   ├─ {} candidates via {}, {} admitted, {} tasks",
            candidates.len(),
            self.selector.name(),
            admitted.len(),
            tasks.len()
        );

        Ok(EventPlan {
            event: event.clone(),
            window,
            candidates: candidates.len(),
            admitted: admitted.len(),
            tasks,
        })
    }

    /// Prepare `event` unless it was already claimed in `processed`
    ///
    /// Returns `None` for an already processed (firm, seal date).
    pub fn assemble(
        &self,
        event: &SealChangeEvent,
        processed: &ProcessedFirmSet,
    ) -> Result<Option<EventPlan>, PanelError> {
        if !processed.try_mark(event.processing_key()) {
            log::info!("⏭️  '{}' ({}) already processed, skipping", event.firm, event.seal_date_str());
            return Ok(None);
        }
        self.prepare(event).map(Some)
    }
}
