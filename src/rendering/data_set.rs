//! A finished panel loaded into the store
//!
//! Rendering works on a store relation holding the panel rows, so derived
//! variables can be computed with joins against the loaded offer and click
//! windows and imputed in place.

use rusqlite::types::Value;
use std::path::Path;

use crate::panel::db::PanelStore;
use crate::panel::error::PanelError;
use crate::panel::query::{Ident, Order, SelectQuery};
use crate::panel::types::ObservationRow;

pub const PANEL_TABLE: &str = "panel";

/// One axis of the (firm, product, week) index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Firm,
    Product,
    Week,
}

impl Axis {
    pub fn column(&self) -> Ident {
        match self {
            Axis::Firm => Ident::from_static("firm_id"),
            Axis::Product => Ident::from_static("product_id"),
            Axis::Week => Ident::from_static("week_running_var"),
        }
    }
}

pub struct PanelDataSet {
    store: PanelStore,
    table: Ident,
}

impl PanelDataSet {
    /// Create (if needed) the panel relation `table`
    pub fn create(store: PanelStore, table: Ident) -> Result<Self, PanelError> {
        store.with_connection(|conn| {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    product_id INTEGER NOT NULL,
                    firm_id TEXT NOT NULL,
                    week_running_var INTEGER NOT NULL,
                    treatment_flag INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_cell ON {table} (firm_id, product_id, week_running_var);",
                table = table
            ))?;
            Ok(())
        })?;
        Ok(Self { store, table })
    }

    /// Panel relation named `panel` filled with `rows`
    pub fn from_rows(store: PanelStore, rows: &[ObservationRow]) -> Result<Self, PanelError> {
        let data_set = Self::create(store, Ident::from_static(PANEL_TABLE))?;
        data_set.insert_rows(rows)?;
        Ok(data_set)
    }

    pub fn table(&self) -> &Ident {
        &self.table
    }

    pub fn store(&self) -> &PanelStore {
        &self.store
    }

    pub fn insert_rows(&self, rows: &[ObservationRow]) -> Result<u64, PanelError> {
        let sql = format!(
            "INSERT INTO {} (product_id, firm_id, week_running_var, treatment_flag) VALUES (?, ?, ?, ?)",
            self.table
        );
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&sql)?;
                for row in rows {
                    stmt.execute(rusqlite::params![
                        row.product_id,
                        row.firm_id,
                        row.week_running_var,
                        row.treatment_flag
                    ])?;
                }
            }
            tx.commit()?;
            Ok(rows.len() as u64)
        })
    }

    /// Load a panel file written by the CSV panel writer
    pub fn load_csv(&self, path: &Path) -> Result<u64, PanelError> {
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader.deserialize::<ObservationRow>().collect::<Result<Vec<_>, _>>()?;
        let inserted = self.insert_rows(&rows)?;
        log::info!("📥 Loaded {} panel rows from {}", inserted, path.display());
        Ok(inserted)
    }

    pub fn row_count(&self) -> Result<u64, PanelError> {
        let query = SelectQuery::from(self.table.clone()).count_as(Ident::from_static("n")).build();
        let counts = self.store.query_i64s(&query)?;
        Ok(counts.first().copied().unwrap_or(0) as u64)
    }

    /// Distinct values of one axis, ascending
    pub fn axis_values(&self, axis: Axis) -> Result<Vec<Value>, PanelError> {
        let query = SelectQuery::from(self.table.clone())
            .distinct()
            .column(axis.column())
            .order_by(axis.column(), Order::Asc)
            .build();
        self.store.query_map(&query, |row| row.get::<_, Value>(0))
    }

    /// Column names of the panel relation, in table order
    pub fn column_names(&self) -> Result<Vec<String>, PanelError> {
        self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", self.table))?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
    }

    pub fn has_column(&self, column: &Ident) -> Result<bool, PanelError> {
        Ok(self.column_names()?.iter().any(|name| name == column.as_str()))
    }

    /// Write every column of the panel, rendered variables included, to a CSV file
    ///
    /// Rows keep insertion order; NULL cells are written as empty fields.
    pub fn export_csv(&self, path: &Path) -> Result<u64, PanelError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let header = self.column_names()?;
        let rows: Vec<Vec<String>> = self.store.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY rowid", self.table))?;
            let rows = stmt
                .query_map([], |row| {
                    (0..header.len())
                        .map(|i| row.get::<_, Value>(i).map(|value| csv_field(&value)))
                        .collect::<rusqlite::Result<Vec<String>>>()
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&header)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        writer.flush()?;

        log::info!("📤 Exported {} panel rows ({} columns) to {}", rows.len(), header.len(), path.display());
        Ok(rows.len() as u64)
    }

    /// Add a nullable REAL column for a derived variable; no-op if present
    pub fn add_column(&self, column: &Ident) -> Result<(), PanelError> {
        if self.has_column(column)? {
            return Ok(());
        }
        self.store.with_connection(|conn| {
            conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} REAL", self.table, column), [])?;
            Ok(())
        })?;
        log::debug!("   ├─ Added column '{}' to '{}'", column, self.table);
        Ok(())
    }
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => b.iter().map(|byte| format!("{:02x}", byte)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(product_id: i64, firm: &str, week: i64, treated: u8) -> ObservationRow {
        ObservationRow { product_id, firm_id: firm.to_string(), week_running_var: week, treatment_flag: treated }
    }

    #[test]
    fn test_axis_values_are_distinct_and_sorted() {
        let store = PanelStore::open_in_memory().unwrap();
        let data_set = PanelDataSet::from_rows(
            store,
            &[row(2, "shop-b", 11, 0), row(1, "shop-a", 10, 1), row(1, "shop-a", 11, 1)],
        )
        .unwrap();

        assert_eq!(data_set.row_count().unwrap(), 3);
        assert_eq!(
            data_set.axis_values(Axis::Firm).unwrap(),
            vec![Value::Text("shop-a".to_string()), Value::Text("shop-b".to_string())]
        );
        assert_eq!(data_set.axis_values(Axis::Week).unwrap(), vec![Value::Integer(10), Value::Integer(11)]);
    }

    #[test]
    fn test_load_csv_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.csv");
        std::fs::write(
            &path,
            "product_id,firm_id,week_running_var,treatment_flag\n1,shop-a,260,1\n1,shop-b,260,0\n",
        )
        .unwrap();

        let data_set = PanelDataSet::create(PanelStore::open_in_memory().unwrap(), Ident::from_static("panel")).unwrap();
        assert_eq!(data_set.load_csv(&path).unwrap(), 2);
        assert_eq!(data_set.row_count().unwrap(), 2);
    }

    #[test]
    fn test_export_csv_writes_every_column() {
        let dir = TempDir::new().unwrap();
        let data_set = PanelDataSet::from_rows(
            PanelStore::open_in_memory().unwrap(),
            &[row(1, "shop-a", 260, 1), row(1, "shop-b", 260, 0)],
        )
        .unwrap();
        let column = Ident::from_static("clicks_total");
        data_set.add_column(&column).unwrap();
        data_set
            .store()
            .with_connection(|conn| {
                conn.execute("UPDATE panel SET clicks_total = 2.5 WHERE firm_id = 'shop-a'", [])?;
                Ok(())
            })
            .unwrap();

        let path = dir.path().join("out/rendered.csv");
        assert_eq!(data_set.export_csv(&path).unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(
            header,
            vec!["product_id", "firm_id", "week_running_var", "treatment_flag", "clicks_total"]
        );
        let records: Vec<Vec<String>> = reader
            .records()
            .map(|record| record.unwrap().iter().map(str::to_string).collect())
            .collect();
        assert_eq!(records[0], vec!["1", "shop-a", "260", "1", "2.5"]);
        assert_eq!(records[1], vec!["1", "shop-b", "260", "0", ""]);
    }

    #[test]
    fn test_add_column_is_idempotent() {
        let data_set = PanelDataSet::from_rows(PanelStore::open_in_memory().unwrap(), &[row(1, "shop-a", 1, 1)]).unwrap();
        let column = Ident::from_static("clicks_total");

        assert!(!data_set.has_column(&column).unwrap());
        data_set.add_column(&column).unwrap();
        data_set.add_column(&column).unwrap();
        assert!(data_set.has_column(&column).unwrap());
    }
}
