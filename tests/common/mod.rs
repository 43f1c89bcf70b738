//! Partition fixtures for integration tests

#![allow(dead_code)]

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use sealpanel::panel::reclaim::MemoryProbe;
use sealpanel::panel::windows::date_to_unix;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn unix(y: i32, m: u32, d: u32) -> i64 {
    date_to_unix(date(y, m, d))
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

/// `(product, firm, begin, end)` offer spells
pub fn write_offers(path: &Path, offers: &[(i64, &str, i64, i64)]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("produkt_id", DataType::Int64, false),
        Field::new("haendler_bez", DataType::Utf8, false),
        Field::new("dtimebegin", DataType::Int64, false),
        Field::new("dtimeend", DataType::Int64, false),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(offers.iter().map(|o| o.0).collect::<Vec<_>>())),
        Arc::new(StringArray::from(offers.iter().map(|o| o.1).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.2).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(offers.iter().map(|o| o.3).collect::<Vec<_>>())),
    ];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

/// `(product, firm, timestamp, ip)` clicks
pub fn write_clicks(path: &Path, clicks: &[(i64, &str, i64, &str)]) {
    let schema = Arc::new(Schema::new(vec![
        Field::new("produkt_id", DataType::Int64, false),
        Field::new("haendler_bez", DataType::Utf8, false),
        Field::new("timestamp", DataType::Int64, false),
        Field::new("ip", DataType::Utf8, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(clicks.iter().map(|c| c.0).collect::<Vec<_>>())),
        Arc::new(StringArray::from(clicks.iter().map(|c| c.1).collect::<Vec<_>>())),
        Arc::new(Int64Array::from(clicks.iter().map(|c| c.2).collect::<Vec<_>>())),
        Arc::new(StringArray::from(clicks.iter().map(|c| Some(c.3)).collect::<Vec<_>>())),
    ];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

pub fn write_scraper_ips(path: &Path, ips: &[&str]) {
    let schema = Arc::new(Schema::new(vec![Field::new("user_ip", DataType::Utf8, false)]));
    let columns: Vec<ArrayRef> = vec![Arc::new(StringArray::from(ips.to_vec()))];
    write_batch(path, RecordBatch::try_new(schema, columns).unwrap());
}

/// Probe reporting a constant resident set size
pub struct StaticProbe(pub u64);

impl MemoryProbe for StaticProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}
