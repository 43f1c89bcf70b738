//! Derived per-cell variables
//!
//! A [`Variable`] is a count over one of the loaded source relations, taken
//! per (product, firm, week) cell of the panel. Cells whose week lies outside
//! the time range covered by the source relation are unobserved (NULL) and are
//! left to the variable's imputation strategy.

use std::sync::Arc;

use crate::panel::db::Relation;
use crate::panel::error::PanelError;
use crate::panel::query::{apply_criteria, Ident, Predicate, QueryCriterion, SelectQuery};
use crate::panel::types::{FirmId, ProductId};
use crate::panel::windows::{unix_from_running_var, UNIX_WEEK};

use super::data_set::PanelDataSet;
use super::imputation::{MeanImputationStrategy, MeanImputer};
use super::space_selector::{validate_selection_space, RenderStrategy, SpaceSelector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSource {
    /// Clicks on the product at the firm during the week
    ClickCount,
    /// Offer spells of the product at the firm overlapping the week
    ActiveOfferCount,
}

impl VariableSource {
    fn relation(&self) -> Relation {
        match self {
            VariableSource::ClickCount => Relation::Clicks,
            VariableSource::ActiveOfferCount => Relation::Offers,
        }
    }

    /// Earliest and latest time the relation holds data for
    fn coverage_query(&self) -> SelectQuery {
        let (start, end) = match self {
            VariableSource::ClickCount => ("timestamp", "timestamp"),
            VariableSource::ActiveOfferCount => ("dtimebegin", "dtimeend"),
        };
        SelectQuery::from(self.relation().ident())
            .min_as(Ident::from_static(start), Ident::from_static("first_time"))
            .max_as(Ident::from_static(end), Ident::from_static("last_time"))
    }

    fn cell_query(&self, product: ProductId, firm: &str, week: i64) -> SelectQuery {
        let from = unix_from_running_var(week);
        let query = SelectQuery::from(self.relation().ident())
            .count_as(Ident::from_static("n"))
            .filter(Predicate::Eq(Ident::from_static("produkt_id"), product.into()))
            .filter(Predicate::Eq(Ident::from_static("haendler_bez"), firm.to_string().into()));
        match self {
            VariableSource::ClickCount => {
                query.filter(Predicate::Between(Ident::from_static("timestamp"), from, from + UNIX_WEEK - 1))
            }
            VariableSource::ActiveOfferCount => query.filter(Predicate::Overlaps {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                from,
                to: from + UNIX_WEEK,
            }),
        }
    }
}

pub struct Variable {
    /// Column name in the panel relation
    pub name: Ident,
    pub description: String,
    pub source: VariableSource,
    pub imputation: MeanImputationStrategy,
    /// Applied to every source query (e.g. scraper exclusion for clicks)
    pub criteria: Vec<Arc<dyn QueryCriterion>>,
}

impl Variable {
    pub fn new(name: Ident, description: impl Into<String>, source: VariableSource) -> Self {
        Self {
            name,
            description: description.into(),
            source,
            imputation: MeanImputationStrategy::None,
            criteria: Vec::new(),
        }
    }

    pub fn with_imputation(mut self, imputation: MeanImputationStrategy) -> Self {
        self.imputation = imputation;
        self
    }

    pub fn with_criterion(mut self, criterion: Arc<dyn QueryCriterion>) -> Self {
        self.criteria.push(criterion);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderReport {
    pub strategies: [RenderStrategy; 3],
    /// Cells in the selected space
    pub cells: usize,
    pub observed: usize,
    pub imputed: usize,
}

pub struct VariableRenderer<'a> {
    data_set: &'a PanelDataSet,
}

impl<'a> VariableRenderer<'a> {
    pub fn new(data_set: &'a PanelDataSet) -> Self {
        Self { data_set }
    }

    /// Compute `variable` for every selected cell, then impute the gaps
    pub fn render(&self, variable: &Variable, selector: &SpaceSelector) -> Result<RenderReport, PanelError> {
        let strategies = selector.strategies();
        if !validate_selection_space(&strategies, selector) {
            return Err(PanelError::InvalidSelection(format!(
                "selection does not fit strategies {:?}",
                strategies
            )));
        }
        selector.check_coordinates(self.data_set)?;

        log::info!("🎨 Rendering '{}' ({})", variable.name, variable.description);
        log::info!("   ├─ Strategies (firm, product, week): {:?}", strategies);

        let store = self.data_set.store();
        let table = self.data_set.table();
        self.data_set.add_column(&variable.name)?;

        let mut cells_query = SelectQuery::from(table.clone())
            .column(Ident::from_static("rowid"))
            .column(Ident::from_static("product_id"))
            .column(Ident::from_static("firm_id"))
            .column(Ident::from_static("week_running_var"));
        for predicate in selector.predicates() {
            cells_query = cells_query.filter(predicate);
        }
        let cells: Vec<(i64, ProductId, FirmId, i64)> = store.query_map(&cells_query.build(), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;

        store.ensure_relation(variable.source.relation())?;
        let coverage: Option<(i64, i64)> = store
            .query_map(&variable.source.coverage_query().build(), |row| {
                Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, Option<i64>>(1)?))
            })?
            .into_iter()
            .next()
            .and_then(|(first, last)| first.zip(last));

        // Half-open [first, end): click timestamps are instants, offer ends are exclusive
        let coverage = coverage.map(|(first, last)| match variable.source {
            VariableSource::ClickCount => (first, last + 1),
            VariableSource::ActiveOfferCount => (first, last),
        });

        let mut values: Vec<(i64, Option<i64>)> = Vec::with_capacity(cells.len());
        for (rowid, product, firm, week) in &cells {
            let week_start = unix_from_running_var(*week);
            let observed = coverage
                .map(|(first, end)| week_start < end && week_start + UNIX_WEEK > first)
                .unwrap_or(false);
            if !observed {
                values.push((*rowid, None));
                continue;
            }
            let query = apply_criteria(variable.source.cell_query(*product, firm, *week), &variable.criteria);
            let count = store.query_i64s(&query.build())?.first().copied().unwrap_or(0);
            values.push((*rowid, Some(count)));
        }

        let update_sql = format!("UPDATE {} SET {} = ? WHERE rowid = ?", table, variable.name);
        store.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&update_sql)?;
                for (rowid, value) in &values {
                    stmt.execute(rusqlite::params![value, rowid])?;
                }
            }
            tx.commit()?;
            Ok(())
        })?;

        let observed = values.iter().filter(|(_, v)| v.is_some()).count();
        let imputed = MeanImputer::new(store.clone()).impute(
            variable.imputation,
            table,
            &variable.name,
            &variable.name,
            &selector.predicates(),
        )?;

        log::info!("   └─ {} cells, {} observed, {} imputed", cells.len(), observed, imputed);
        Ok(RenderReport { strategies, cells: cells.len(), observed, imputed })
    }

    /// Render several variables over the same selection, in order
    ///
    /// Stops at the first variable that fails; earlier columns stay rendered.
    pub fn render_all(&self, variables: &[Variable], selector: &SpaceSelector) -> Result<Vec<RenderReport>, PanelError> {
        log::info!("🎨 Rendering {} variables over '{}'", variables.len(), self.data_set.table());
        let mut reports = Vec::with_capacity(variables.len());
        for variable in variables {
            match self.render(variable, selector) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    log::error!("❌ Rendering '{}' failed: {}", variable.name, e);
                    return Err(e);
                }
            }
        }
        log::info!("✅ Rendered {} variables", reports.len());
        Ok(reports)
    }
}
