//! Windowed partition ingestion
//!
//! Loads the offer and click partitions of one seal event into the store.
//! Each partition file is imported at most once per store lifetime (tracked by
//! the durable `file_log`), and the windowed relations are freed according to
//! their [`TablePolicy`] before the next window is loaded.
//!
//! ## Flow per event
//!
//! ```text
//! ensure_capacity(offers) ──► free? ──► recovery pause
//! ensure_capacity(clicks) ──► free? ──► recovery pause
//! load(offers, weekly keys)
//! load(clicks, monthly keys)
//! ```

use arrow::array::{Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use rusqlite::Transaction;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::config::{PanelConfig, TablePolicy};
use super::db::{PanelStore, Relation};
use super::error::PanelError;
use super::reclaim::RecoveryPause;
use super::windows::{Granularity, PartitionKey};

const READ_BATCH_SIZE: usize = 8192;

/// Where partition files live on disk
#[derive(Debug, Clone)]
pub struct PartitionSource {
    pub data_dir: PathBuf,
    pub offer_folders: Vec<String>,
    pub click_folder: String,
}

impl PartitionSource {
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            offer_folders: config.offer_folders.clone(),
            click_folder: config.click_folder.clone(),
        }
    }

    /// First existing path of a partition file, if any
    pub fn locate(&self, relation: Relation, file_name: &str) -> Option<PathBuf> {
        let folders: Vec<&str> = match relation {
            Relation::Offers => self.offer_folders.iter().map(String::as_str).collect(),
            Relation::Clicks => vec![self.click_folder.as_str()],
            Relation::ScraperIps => vec![""],
        };
        folders
            .into_iter()
            .map(|folder| self.data_dir.join(folder).join(file_name))
            .find(|path| path.is_file())
    }
}

/// Row count and age of a windowed relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLifecycleState {
    pub rows: u64,
    /// Seconds since the oldest partition still in the relation was loaded
    pub age_secs: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeReason {
    DropAfterUse,
    RowLimit { rows: u64, limit: u64 },
    Expired { age_secs: i64, limit_secs: u64 },
}

/// Rows present after loading one event's windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowLoad {
    pub offer_rows: u64,
    pub click_rows: u64,
    pub files_loaded: usize,
    pub files_missing: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct LoadReport {
    rows: u64,
    loaded: usize,
    missing: usize,
}

pub struct DataIngestionManager {
    store: PanelStore,
    source: PartitionSource,
    offer_policy: TablePolicy,
    click_policy: TablePolicy,
    recovery: RecoveryPause,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl DataIngestionManager {
    pub fn new(
        store: PanelStore,
        source: PartitionSource,
        offer_policy: TablePolicy,
        click_policy: TablePolicy,
        recovery: RecoveryPause,
    ) -> Self {
        Self::new_with_timestamp_fn(
            store,
            source,
            offer_policy,
            click_policy,
            recovery,
            Box::new(|| chrono::Utc::now().timestamp()),
        )
    }

    /// Create a manager with a custom clock, used for testing cache expiry
    pub fn new_with_timestamp_fn(
        store: PanelStore,
        source: PartitionSource,
        offer_policy: TablePolicy,
        click_policy: TablePolicy,
        recovery: RecoveryPause,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        Self { store, source, offer_policy, click_policy, recovery, now_fn }
    }

    pub fn store(&self) -> &PanelStore {
        &self.store
    }

    fn policy(&self, relation: Relation) -> Option<&TablePolicy> {
        match relation {
            Relation::Offers => Some(&self.offer_policy),
            Relation::Clicks => Some(&self.click_policy),
            Relation::ScraperIps => None,
        }
    }

    pub fn lifecycle_state(&self, relation: Relation) -> Result<TableLifecycleState, PanelError> {
        let rows = self.store.row_count(relation)?;
        let age_secs = self
            .store
            .oldest_ingestion(relation)?
            .map(|loaded_at| (self.now_fn)() - loaded_at);
        Ok(TableLifecycleState { rows, age_secs })
    }

    /// Whether the relation's policy requires a free before the next load
    pub fn free_reason(&self, relation: Relation) -> Result<Option<FreeReason>, PanelError> {
        let Some(policy) = self.policy(relation) else {
            return Ok(None);
        };
        let state = self.lifecycle_state(relation)?;
        let occupied = state.rows > 0 || state.age_secs.is_some();

        if policy.drop_after_use && occupied {
            return Ok(Some(FreeReason::DropAfterUse));
        }
        if let Some(limit) = policy.row_limit {
            if state.rows > limit {
                return Ok(Some(FreeReason::RowLimit { rows: state.rows, limit }));
            }
        }
        if let (Some(limit), Some(age_secs)) = (policy.cache_duration, state.age_secs) {
            if age_secs > limit.as_secs() as i64 {
                return Ok(Some(FreeReason::Expired { age_secs, limit_secs: limit.as_secs() }));
            }
        }
        Ok(None)
    }

    /// Free the relation if its policy says so; returns whether it was freed
    pub fn ensure_capacity(&self, relation: Relation) -> Result<bool, PanelError> {
        match self.free_reason(relation)? {
            Some(reason) => {
                log::info!("♻️  Freeing '{}': {:?}", relation.table_name(), reason);
                self.free(relation)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the relation and its log entries, then wait for memory to settle
    pub fn free(&self, relation: Relation) -> Result<(), PanelError> {
        self.store.free(relation)?;
        self.recovery.wait()?;
        Ok(())
    }

    /// Import every not-yet-ingested partition of the window
    ///
    /// Missing files are skipped with a warning. Returns the relation's row
    /// count afterwards.
    pub fn load(&self, relation: Relation, keys: &[PartitionKey]) -> Result<u64, PanelError> {
        Ok(self.load_window(relation, keys)?.rows)
    }

    fn load_window(&self, relation: Relation, keys: &[PartitionKey]) -> Result<LoadReport, PanelError> {
        let granularity = match relation {
            Relation::Offers => Granularity::Weekly,
            Relation::Clicks => Granularity::Monthly,
            Relation::ScraperIps => {
                return Err(PanelError::StoreMutation(
                    "scraper_ips is not a windowed relation".to_string(),
                ))
            }
        };

        self.store.ensure_relation(relation)?;
        let mut report = LoadReport::default();

        for key in keys {
            let file_name = key.file_name(granularity);
            if self.store.is_ingested(&file_name)? {
                log::debug!("   ├─ Already ingested: {}", file_name);
                continue;
            }

            let Some(path) = self.source.locate(relation, &file_name) else {
                let missing = PanelError::MissingPartitionFile { path: PathBuf::from(&file_name) };
                log::warn!("⚠️  {} (skipped)", missing);
                report.missing += 1;
                continue;
            };

            let imported = self.import_partition(relation, &file_name, &path)?;
            report.loaded += 1;
            log::debug!("   ├─ Loaded {} rows from {}", imported, path.display());
        }

        report.rows = self.store.row_count(relation)?;
        if report.loaded == 0 && report.rows == 0 {
            log::warn!("⚠️  No {} data found for this window", relation.table_name());
        } else {
            log::info!(
                "   └─ {} rows in '{}' ({} files loaded, {} missing)",
                report.rows,
                relation.table_name(),
                report.loaded,
                report.missing
            );
        }
        Ok(report)
    }

    /// Apply policies, then load both windows of one seal event
    pub fn prepare_event_windows(
        &self,
        offer_keys: &[PartitionKey],
        click_keys: &[PartitionKey],
    ) -> Result<WindowLoad, PanelError> {
        self.ensure_capacity(Relation::Offers)?;
        self.ensure_capacity(Relation::Clicks)?;

        let offers = self.load_window(Relation::Offers, offer_keys)?;
        let clicks = self.load_window(Relation::Clicks, click_keys)?;

        Ok(WindowLoad {
            offer_rows: offers.rows,
            click_rows: clicks.rows,
            files_loaded: offers.loaded + clicks.loaded,
            files_missing: offers.missing + clicks.missing,
        })
    }

    /// Load the scraper IP list once; it is never freed
    pub fn load_scraper_ips(&self, path: &Path) -> Result<u64, PanelError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        self.store.ensure_relation(Relation::ScraperIps)?;
        if !self.store.is_ingested(&file_name)? {
            if !path.is_file() {
                log::warn!(
                    "⚠️  {} (scraper clicks will not be excluded)",
                    PanelError::MissingPartitionFile { path: path.to_path_buf() }
                );
                return Ok(0);
            }
            self.import_partition(Relation::ScraperIps, &file_name, path)?;
        }
        let count = self.store.row_count(Relation::ScraperIps)?;
        log::info!("🛡️  {} scraper IPs loaded", count);
        Ok(count)
    }

    /// Import one file and log it, all in one transaction
    fn import_partition(&self, relation: Relation, file_name: &str, path: &Path) -> Result<u64, PanelError> {
        let now = (self.now_fn)();
        self.store.with_connection(|conn| {
            let tx = conn.transaction()?;
            let imported = match relation {
                Relation::Offers => import_offers(&tx, path)?,
                Relation::Clicks => import_clicks(&tx, path)?,
                Relation::ScraperIps => import_scraper_ips(&tx, path)?,
            };
            tx.execute(
                "INSERT INTO file_log (file_name, relation, insert_timestamp) VALUES (?, ?, ?)",
                rusqlite::params![file_name, relation.table_name(), now],
            )?;
            tx.commit()?;
            Ok(imported)
        })
    }
}

/// Batches of a parquet file, restricted to the named top-level columns
fn read_batches(path: &Path, columns: &[&str]) -> Result<Vec<RecordBatch>, PanelError> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

    let roots: Vec<usize> = builder
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, field)| columns.contains(&field.name().as_str()))
        .map(|(i, _)| i)
        .collect();
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);

    let reader = builder.with_projection(mask).with_batch_size(READ_BATCH_SIZE).build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

fn int64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array, PanelError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| PanelError::Schema(format!("missing column '{}'", name)))?;
    let casted = cast(column.as_ref(), &DataType::Int64)?;
    casted
        .as_any()
        .downcast_ref::<Int64Array>()
        .cloned()
        .ok_or_else(|| PanelError::Schema(format!("column '{}' is not integer", name)))
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<StringArray, PanelError> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| PanelError::Schema(format!("missing column '{}'", name)))?;
    let casted = cast(column.as_ref(), &DataType::Utf8)?;
    casted
        .as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| PanelError::Schema(format!("column '{}' is not text", name)))
}

fn import_offers(tx: &Transaction<'_>, path: &Path) -> Result<u64, PanelError> {
    let batches = read_batches(path, &["produkt_id", "haendler_bez", "dtimebegin", "dtimeend"])?;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO offers (produkt_id, haendler_bez, dtimebegin, dtimeend) VALUES (?, ?, ?, ?)",
    )?;

    let mut inserted = 0u64;
    let mut skipped = 0u64;
    for batch in &batches {
        let products = int64_column(batch, "produkt_id")?;
        let firms = string_column(batch, "haendler_bez")?;
        let begins = int64_column(batch, "dtimebegin")?;
        let ends = int64_column(batch, "dtimeend")?;

        for i in 0..batch.num_rows() {
            if products.is_null(i) || firms.is_null(i) || begins.is_null(i) || ends.is_null(i) {
                skipped += 1;
                continue;
            }
            let begin = begins.value(i);
            // Zero-length spells are kept as one-second spells
            let end = ends.value(i).max(begin + 1);
            stmt.execute(rusqlite::params![products.value(i), firms.value(i), begin, end])?;
            inserted += 1;
        }
    }

    if skipped > 0 {
        log::debug!("   ├─ Skipped {} offer rows with NULL keys in {}", skipped, path.display());
    }
    Ok(inserted)
}

fn import_clicks(tx: &Transaction<'_>, path: &Path) -> Result<u64, PanelError> {
    let batches = read_batches(path, &["produkt_id", "haendler_bez", "timestamp", "ip"])?;
    let mut stmt = tx.prepare_cached(
        "INSERT INTO clicks (produkt_id, haendler_bez, timestamp, ip) VALUES (?, ?, ?, ?)",
    )?;

    let mut inserted = 0u64;
    for batch in &batches {
        let products = int64_column(batch, "produkt_id")?;
        let firms = string_column(batch, "haendler_bez")?;
        let timestamps = int64_column(batch, "timestamp")?;
        let ips = match batch.column_by_name("ip") {
            Some(_) => Some(string_column(batch, "ip")?),
            None => None,
        };

        for i in 0..batch.num_rows() {
            if products.is_null(i) || firms.is_null(i) || timestamps.is_null(i) {
                continue;
            }
            let ip = ips
                .as_ref()
                .filter(|column| !column.is_null(i))
                .map(|column| column.value(i).to_string());
            stmt.execute(rusqlite::params![products.value(i), firms.value(i), timestamps.value(i), ip])?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn import_scraper_ips(tx: &Transaction<'_>, path: &Path) -> Result<u64, PanelError> {
    let batches = read_batches(path, &["ip", "user_ip"])?;
    let mut stmt = tx.prepare_cached("INSERT OR IGNORE INTO scraper_ips (ip) VALUES (?)")?;

    let mut inserted = 0u64;
    for batch in &batches {
        let column_name = if batch.column_by_name("ip").is_some() { "ip" } else { "user_ip" };
        let ips = string_column(batch, column_name)?;
        for i in 0..batch.num_rows() {
            if !ips.is_null(i) {
                inserted += stmt.execute([ips.value(i)])? as u64;
            }
        }
    }
    Ok(inserted)
}
