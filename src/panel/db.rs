//! Embedded analytical store for panel construction
//!
//! SQLite via rusqlite. One `PanelStore` is opened per run and handed to every
//! component that needs it; clones share the same connection.
//!
//! Tables:
//! - `file_log` - durable ingestion log (partition file -> ingestion time)
//! - `offers` - offer spells of the currently loaded weekly window
//! - `clicks` - click events of the currently loaded monthly window
//! - `scraper_ips` - hashed IPs of known scrapers (kept for the whole run)

use rusqlite::{params_from_iter, Connection, Row};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::PanelError;
use super::query::{BuiltQuery, Ident};

/// Store-managed relations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    Offers,
    Clicks,
    ScraperIps,
}

impl Relation {
    pub fn table_name(&self) -> &'static str {
        match self {
            Relation::Offers => "offers",
            Relation::Clicks => "clicks",
            Relation::ScraperIps => "scraper_ips",
        }
    }

    pub fn ident(&self) -> Ident {
        Ident::from_static(self.table_name())
    }

    /// DDL for the relation and its indexes (idempotent)
    fn create_sql(&self) -> &'static str {
        match self {
            Relation::Offers => {
                r#"
                CREATE TABLE IF NOT EXISTS offers (
                    produkt_id INTEGER NOT NULL,
                    haendler_bez TEXT NOT NULL,
                    dtimebegin INTEGER NOT NULL,
                    dtimeend INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_offers_firm_product ON offers (haendler_bez, produkt_id);
                CREATE INDEX IF NOT EXISTS idx_offers_product ON offers (produkt_id, dtimebegin);
                "#
            }
            Relation::Clicks => {
                r#"
                CREATE TABLE IF NOT EXISTS clicks (
                    produkt_id INTEGER NOT NULL,
                    haendler_bez TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    ip TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_clicks_firm_time ON clicks (haendler_bez, timestamp);
                "#
            }
            Relation::ScraperIps => {
                r#"
                CREATE TABLE IF NOT EXISTS scraper_ips (
                    ip TEXT PRIMARY KEY
                );
                "#
            }
        }
    }
}

const FILE_LOG_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS file_log (
    file_name TEXT PRIMARY KEY,
    relation TEXT NOT NULL,
    insert_timestamp INTEGER NOT NULL
);
"#;

/// Engine-level tuning applied when the store is opened
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreSettings {
    /// Soft heap limit in bytes (`PRAGMA soft_heap_limit`)
    pub memory_cap_bytes: Option<u64>,
    /// Auxiliary worker threads (`PRAGMA threads`)
    pub threads: u32,
}

/// Create all store relations and apply engine settings
///
/// Every statement uses `IF NOT EXISTS`, so this is safe to run on an
/// existing store; the durable `file_log` survives restarts untouched.
pub fn run_schema_migrations(conn: &mut Connection, settings: &StoreSettings) -> Result<(), PanelError> {
    // PRAGMA journal_mode returns a row, so pragma_update rather than execute
    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for store database");

    if let Some(cap) = settings.memory_cap_bytes {
        conn.pragma_update(None, "soft_heap_limit", cap as i64)?;
        log::info!("   ├─ Soft heap limit: {} bytes", cap);
    }
    if settings.threads > 0 {
        conn.pragma_update(None, "threads", settings.threads as i64)?;
        log::info!("   └─ Worker threads: {}", settings.threads);
    }

    log::info!("🔧 Running store schema migrations");

    conn.execute_batch(FILE_LOG_SQL)?;
    log::info!("   ├─ ✅ file_log");

    for relation in [Relation::Offers, Relation::Clicks, Relation::ScraperIps] {
        conn.execute_batch(relation.create_sql())?;
        log::info!("   ├─ ✅ {}", relation.table_name());
    }

    log::info!("   └─ ✅ Store schema ready");
    Ok(())
}

/// Handle to the run's store
#[derive(Clone)]
pub struct PanelStore {
    conn: Arc<Mutex<Connection>>,
}

impl PanelStore {
    /// Open (or create) the store file and run migrations
    pub fn open(db_path: &str, settings: &StoreSettings) -> Result<Self, PanelError> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, settings)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Throwaway store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, PanelError> {
        let mut conn = Connection::open_in_memory()?;
        run_schema_migrations(&mut conn, &StoreSettings::default())?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PanelError> {
        self.conn
            .lock()
            .map_err(|_| PanelError::StoreMutation("store connection lock poisoned".to_string()))
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, PanelError>,
    ) -> Result<T, PanelError> {
        let mut conn = self.lock()?;
        f(&mut conn)
    }

    /// (Re)create a relation that may have been dropped by `free`
    pub fn ensure_relation(&self, relation: Relation) -> Result<(), PanelError> {
        let conn = self.lock()?;
        conn.execute_batch(relation.create_sql())?;
        Ok(())
    }

    pub fn row_count(&self, relation: Relation) -> Result<u64, PanelError> {
        let conn = self.lock()?;
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [relation.table_name()],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(0);
        }
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", relation.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn is_ingested(&self, file_name: &str) -> Result<bool, PanelError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT 1 FROM file_log WHERE file_name = ?")?;
        Ok(stmt.exists([file_name])?)
    }

    /// File names recorded for `relation`, oldest first
    pub fn ingested_files(&self, relation: Relation) -> Result<Vec<String>, PanelError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT file_name FROM file_log WHERE relation = ? ORDER BY insert_timestamp, file_name",
        )?;
        let files = stmt
            .query_map([relation.table_name()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Unix time of the oldest ingestion still logged for `relation`
    pub fn oldest_ingestion(&self, relation: Relation) -> Result<Option<i64>, PanelError> {
        let conn = self.lock()?;
        let oldest: Option<i64> = conn.query_row(
            "SELECT MIN(insert_timestamp) FROM file_log WHERE relation = ?",
            [relation.table_name()],
            |row| row.get(0),
        )?;
        Ok(oldest)
    }

    /// Delete all rows, drop the relation and purge its ingestion log entries
    ///
    /// Runs in one transaction: on any failure nothing is changed.
    pub fn free(&self, relation: Relation) -> Result<(), PanelError> {
        let mut conn = self.lock()?;
        let table = relation.table_name();

        let result = (|| -> Result<usize, rusqlite::Error> {
            let tx = conn.transaction()?;
            tx.execute_batch(relation.create_sql())?;
            tx.execute(&format!("DELETE FROM {}", table), [])?;
            tx.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
            let purged = tx.execute("DELETE FROM file_log WHERE relation = ?", [table])?;
            tx.commit()?;
            Ok(purged)
        })();

        match result {
            Ok(purged) => {
                log::info!("🧹 Freed relation '{}' ({} file log entries purged)", table, purged);
                Ok(())
            }
            Err(e) => {
                log::error!("❌ Freeing relation '{}' failed, rolled back: {}", table, e);
                Err(PanelError::StoreMutation(format!("free {}: {}", table, e)))
            }
        }
    }

    /// Run a built query and map every row
    pub fn query_map<T>(
        &self,
        query: &BuiltQuery,
        mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, PanelError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&query.sql)?;
        let rows = stmt
            .query_map(params_from_iter(query.params.iter()), |row| map(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// First column of every row as text
    pub fn query_strings(&self, query: &BuiltQuery) -> Result<Vec<String>, PanelError> {
        self.query_map(query, |row| row.get::<_, String>(0))
    }

    /// First column of every row as integer
    pub fn query_i64s(&self, query: &BuiltQuery) -> Result<Vec<i64>, PanelError> {
        self.query_map(query, |row| row.get::<_, i64>(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::query::{Predicate, SelectQuery};
    use tempfile::NamedTempFile;

    fn create_test_store() -> Result<(NamedTempFile, PanelStore), PanelError> {
        let temp_file = NamedTempFile::new()?;
        let path = temp_file.path().to_str().unwrap().to_string();
        let store = PanelStore::open(&path, &StoreSettings { memory_cap_bytes: None, threads: 2 })?;
        Ok((temp_file, store))
    }

    fn insert_offer(store: &PanelStore, product: i64, firm: &str, begin: i64, end: i64) {
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO offers (produkt_id, haendler_bez, dtimebegin, dtimeend) VALUES (?, ?, ?, ?)",
                    rusqlite::params![product, firm, begin, end],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn log_file(store: &PanelStore, name: &str, relation: Relation) {
        store
            .with_connection(|conn| {
                conn.execute(
                    "INSERT INTO file_log (file_name, relation, insert_timestamp) VALUES (?, ?, ?)",
                    rusqlite::params![name, relation.table_name(), 1_700_000_000i64],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let (temp, store) = create_test_store().unwrap();
        log_file(&store, "angebot_2022w01.parquet", Relation::Offers);
        drop(store);

        // Reopen: schema re-applied, durable log preserved
        let path = temp.path().to_str().unwrap().to_string();
        let store = PanelStore::open(&path, &StoreSettings::default()).unwrap();
        assert!(store.is_ingested("angebot_2022w01.parquet").unwrap());
        assert_eq!(store.row_count(Relation::Offers).unwrap(), 0);
    }

    #[test]
    fn test_free_drops_rows_and_purges_log() {
        let (_temp, store) = create_test_store().unwrap();
        insert_offer(&store, 1, "shop-a", 0, 10);
        insert_offer(&store, 2, "shop-a", 0, 10);
        log_file(&store, "angebot_2022w01.parquet", Relation::Offers);
        log_file(&store, "clicks_2022m01.parquet", Relation::Clicks);

        store.free(Relation::Offers).unwrap();

        assert_eq!(store.row_count(Relation::Offers).unwrap(), 0);
        assert!(!store.is_ingested("angebot_2022w01.parquet").unwrap());
        // Other relations' log entries survive
        assert!(store.is_ingested("clicks_2022m01.parquet").unwrap());

        // Relation is gone until recreated
        let table_exists: bool = store
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'offers'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(!table_exists);

        store.ensure_relation(Relation::Offers).unwrap();
        insert_offer(&store, 3, "shop-b", 0, 10);
        assert_eq!(store.row_count(Relation::Offers).unwrap(), 1);
    }

    #[test]
    fn test_free_rolls_back_when_log_purge_fails() {
        let (_temp, store) = create_test_store().unwrap();
        insert_offer(&store, 1, "shop-a", 0, 10);
        log_file(&store, "angebot_2022w01.parquet", Relation::Offers);
        store
            .with_connection(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER keep_log BEFORE DELETE ON file_log BEGIN SELECT RAISE(ABORT, 'boom'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let result = store.free(Relation::Offers);
        assert!(matches!(result, Err(PanelError::StoreMutation(_))));

        // Neither the rows, the table, nor the log entry were touched
        assert_eq!(store.row_count(Relation::Offers).unwrap(), 1);
        assert!(store.is_ingested("angebot_2022w01.parquet").unwrap());
    }

    #[test]
    fn test_free_of_already_dropped_relation_succeeds() {
        let (_temp, store) = create_test_store().unwrap();
        store.free(Relation::Clicks).unwrap();
        store.free(Relation::Clicks).unwrap();
        assert_eq!(store.row_count(Relation::Clicks).unwrap(), 0);
    }

    #[test]
    fn test_ingested_files_by_relation() {
        let (_temp, store) = create_test_store().unwrap();
        log_file(&store, "angebot_2022w02.parquet", Relation::Offers);
        log_file(&store, "angebot_2022w01.parquet", Relation::Offers);
        log_file(&store, "clicks_2022m01.parquet", Relation::Clicks);

        let files = store.ingested_files(Relation::Offers).unwrap();
        assert_eq!(files, vec!["angebot_2022w01.parquet", "angebot_2022w02.parquet"]);
    }

    #[test]
    fn test_query_builder_roundtrip() {
        let store = PanelStore::open_in_memory().unwrap();
        insert_offer(&store, 7, "shop-a", 100, 200);
        insert_offer(&store, 8, "shop-b", 300, 400);

        let query = SelectQuery::from(Relation::Offers.ident())
            .distinct()
            .column(Ident::from_static("produkt_id"))
            .filter(Predicate::Overlaps {
                start: Ident::from_static("dtimebegin"),
                end: Ident::from_static("dtimeend"),
                from: 150,
                to: 350,
            })
            .build();

        let mut products = store.query_i64s(&query).unwrap();
        products.sort();
        assert_eq!(products, vec![7, 8]);
    }
}
