//! Fixtures and test doubles shared by unit tests

use async_trait::async_trait;
use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::config::RecoveryConfig;
use super::db::{PanelStore, Relation};
use super::error::PanelError;
use super::output_writer::PanelWriter;
use super::reclaim::{MemoryProbe, RecoveryPause};
use super::types::{ObservationRow, Offer};
use super::windows::{date_to_unix, UNIX_DAY};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn unix(y: i32, m: u32, d: u32) -> i64 {
    date_to_unix(date(y, m, d))
}

pub fn days(n: i64) -> i64 {
    n * UNIX_DAY
}

pub fn offer(product_id: i64, firm: &str, start: i64, end: i64) -> Offer {
    Offer { product_id, firm_id: firm.to_string(), interval_start: start, interval_end: end }
}

fn write_batch(path: &Path, batch: RecordBatch) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(&batch).unwrap();
    writer.close().unwrap();
}

pub fn write_offer_partition(path: &Path, offers: &[Offer]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("angebot_id", DataType::Int64, false),
        Field::new("produkt_id", DataType::Int64, false),
        Field::new("haendler_bez", DataType::Utf8, false),
        Field::new("dtimebegin", DataType::Int64, false),
        Field::new("dtimeend", DataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from((0..offers.len() as i64).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.product_id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(offers.iter().map(|o| o.firm_id.as_str()).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.interval_start).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.interval_end).collect::<Vec<_>>())),
    ];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

/// Offer partition lacking the `dtimeend` column
pub fn write_offer_partition_without_end(path: &Path, offers: &[Offer]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("produkt_id", DataType::Int64, false),
        Field::new("haendler_bez", DataType::Utf8, false),
        Field::new("dtimebegin", DataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(offers.iter().map(|o| o.product_id).collect::<Vec<_>>())),
        Arc::new(StringArray::from(offers.iter().map(|o| o.firm_id.as_str()).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.interval_start).collect::<Vec<_>>())),
    ];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

/// `(product, firm, timestamp, ip)` click rows
pub fn write_click_partition(path: &Path, clicks: &[(i64, &str, i64, Option<&str>)]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("ip", DataType::Utf8, true),
        Field::new("produkt_id", DataType::Int64, false),
        Field::new("haendler_bez", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(clicks.iter().map(|c| c.3).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(clicks.iter().map(|c| c.0).collect::<Vec<_>>())),
        Arc::new(StringArray::from(clicks.iter().map(|c| c.1).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(clicks.iter().map(|c| c.2).collect::<Vec<_>>())),
    ];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

pub fn write_scraper_ips(path: &Path, ips: &[&str]) {
    let schema = Arc::new(Schema::new(vec![Field::new("user_ip", DataType::Utf8, false)]));
    let columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(ips.to_vec()))];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

/// Insert spells straight into the `offers` relation
pub fn insert_offers(store: &PanelStore, offers: &[Offer]) {
    store.ensure_relation(Relation::Offers).unwrap();
    store
        .with_connection(|conn| {
            let tx = conn.transaction()?;
            for o in offers {
                tx.execute(
                    "INSERT INTO offers (produkt_id, haendler_bez, dtimebegin, dtimeend) VALUES (?, ?, ?, ?)",
                    rusqlite::params![o.product_id, o.firm_id, o.interval_start, o.interval_end],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .unwrap();
}

/// Insert `(product, firm, timestamp, ip)` rows into the `clicks` relation
pub fn insert_clicks(store: &PanelStore, clicks: &[(i64, &str, i64, Option<&str>)]) {
    store.ensure_relation(Relation::Clicks).unwrap();
    store
        .with_connection(|conn| {
            let tx = conn.transaction()?;
            for (product, firm, timestamp, ip) in clicks {
                tx.execute(
                    "INSERT INTO clicks (produkt_id, haendler_bez, timestamp, ip) VALUES (?, ?, ?, ?)",
                    rusqlite::params![product, firm, timestamp, ip],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .unwrap();
}

pub fn insert_scraper_ips(store: &PanelStore, ips: &[&str]) {
    store
        .with_connection(|conn| {
            for ip in ips {
                conn.execute("INSERT OR IGNORE INTO scraper_ips (ip) VALUES (?)", [ip])?;
            }
            Ok(())
        })
        .unwrap();
}

struct FixedProbe;

impl MemoryProbe for FixedProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(1)
    }
}

/// Recovery pause that samples once and returns
pub fn quick_recovery() -> RecoveryPause {
    RecoveryPause::new(
        RecoveryConfig {
            timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(1),
            rss_target_bytes: None,
        },
        Arc::new(FixedProbe),
        CancellationToken::new(),
    )
}

/// Panel writer that keeps every `write_rows` batch; clones share the buffer
#[derive(Clone, Default)]
pub struct MemoryPanelWriter {
    batches: Arc<Mutex<Vec<Vec<ObservationRow>>>>,
}

impl MemoryPanelWriter {
    pub fn batches(&self) -> Vec<Vec<ObservationRow>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn rows(&self) -> Vec<ObservationRow> {
        self.batches().concat()
    }
}

#[async_trait]
impl PanelWriter for MemoryPanelWriter {
    async fn write_rows(&mut self, rows: &[ObservationRow]) -> Result<(), PanelError> {
        self.batches.lock().unwrap().push(rows.to_vec());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PanelError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
