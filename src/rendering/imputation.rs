//! Mean imputation of derived panel variables
//!
//! Missing cells are filled with the mean of a target column over all rows
//! sharing the strategy's grouping keys (firm, product, week or a pair of
//! them). Groups without any observed value stay NULL.

use rusqlite::types::Value;

use crate::panel::db::PanelStore;
use crate::panel::error::PanelError;
use crate::panel::query::{Ident, Predicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeanImputationStrategy {
    None,
    FirmLevel,
    ProductLevel,
    FirmAndTimeLevel,
    FirmAndProductLevel,
    ProductAndTimeLevel,
}

impl MeanImputationStrategy {
    /// Panel columns that define one imputation group
    pub fn group_columns(&self) -> &'static [&'static str] {
        match self {
            MeanImputationStrategy::None => &[],
            MeanImputationStrategy::FirmLevel => &["firm_id"],
            MeanImputationStrategy::ProductLevel => &["product_id"],
            MeanImputationStrategy::FirmAndTimeLevel => &["firm_id", "week_running_var"],
            MeanImputationStrategy::FirmAndProductLevel => &["firm_id", "product_id"],
            MeanImputationStrategy::ProductAndTimeLevel => &["product_id", "week_running_var"],
        }
    }
}

impl std::str::FromStr for MeanImputationStrategy {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(MeanImputationStrategy::None),
            "firm" => Ok(MeanImputationStrategy::FirmLevel),
            "product" => Ok(MeanImputationStrategy::ProductLevel),
            "firm_time" => Ok(MeanImputationStrategy::FirmAndTimeLevel),
            "firm_product" => Ok(MeanImputationStrategy::FirmAndProductLevel),
            "product_time" => Ok(MeanImputationStrategy::ProductAndTimeLevel),
            other => Err(PanelError::InvalidSelection(format!("unknown imputation strategy '{}'", other))),
        }
    }
}

pub struct MeanImputer {
    store: PanelStore,
}

impl MeanImputer {
    pub fn new(store: PanelStore) -> Self {
        Self { store }
    }

    /// Fill NULL cells of `column` in `table`; returns the number of cells filled
    ///
    /// `scope` restricts which rows are updated; the means are always taken
    /// over the whole table.
    pub fn impute(
        &self,
        strategy: MeanImputationStrategy,
        table: &Ident,
        column: &Ident,
        target: &Ident,
        scope: &[Predicate],
    ) -> Result<usize, PanelError> {
        let groups = strategy.group_columns();
        if groups.is_empty() {
            return Ok(0);
        }

        let correlation: Vec<String> = groups
            .iter()
            .map(|group| format!("s.{group} = {table}.{group}", group = group, table = table))
            .collect();

        let mut sql = format!(
            "UPDATE {table} SET {column} = (SELECT AVG(s.{target}) FROM {table} AS s WHERE {correlation}) \
             WHERE {column} IS NULL",
            table = table,
            column = column,
            target = target,
            correlation = correlation.join(" AND "),
        );
        let mut params: Vec<Value> = Vec::new();
        for predicate in scope {
            sql.push_str(" AND ");
            predicate.render(&mut sql, &mut params);
        }

        let null_count_sql = format!("SELECT COUNT(*) FROM {} WHERE {} IS NULL", table, column);
        let filled = self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let before: i64 = tx.query_row(&null_count_sql, [], |row| row.get(0))?;
            tx.execute(&sql, rusqlite::params_from_iter(params.iter()))?;
            let after: i64 = tx.query_row(&null_count_sql, [], |row| row.get(0))?;
            tx.commit()?;
            Ok((before - after) as usize)
        })?;

        log::debug!("   ├─ Imputed {} cells of '{}' ({:?})", filled, column, strategy);
        Ok(filled)
    }
}
