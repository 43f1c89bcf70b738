//! Seal-event table and allowed-firm list
//!
//! Both are delimited text files produced upstream by the retailer-name
//! matching step. Only the named columns are read; anything else in the file
//! (country flags and the like) is ignored.

use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use super::error::PanelError;
use super::types::{FirmId, SealChangeEvent};
use super::windows::parse_seal_date;

/// Every firm that adopted a seal, whether or not its event is processed
pub type SealFirmSet = HashSet<FirmId>;

#[derive(Debug, Deserialize)]
struct SealEventRecord {
    seal_firm_id: String,
    matched_haendler_bez: String,
    seal_date_str: String,
}

#[derive(Debug, Deserialize)]
struct AllowedFirmRecord {
    haendler_bez: String,
}

#[derive(Debug, Default)]
pub struct SealEventTable {
    /// Events in file order
    pub events: Vec<SealChangeEvent>,
    pub seal_firms: SealFirmSet,
    /// Rows skipped because their date could not be parsed
    pub malformed: usize,
}

fn reader_builder(delimiter: u8) -> csv::ReaderBuilder {
    let mut builder = csv::ReaderBuilder::new();
    builder.delimiter(delimiter).flexible(true).trim(csv::Trim::All);
    builder
}

pub fn load_seal_events(path: &Path, delimiter: u8) -> Result<SealEventTable, PanelError> {
    let file = std::fs::File::open(path)?;
    let table = read_seal_events(file, delimiter)?;
    log::info!(
        "📋 Loaded {} seal events ({} seal firms, {} malformed) from {}",
        table.events.len(),
        table.seal_firms.len(),
        table.malformed,
        path.display()
    );
    Ok(table)
}

pub fn read_seal_events<R: Read>(input: R, delimiter: u8) -> Result<SealEventTable, PanelError> {
    let mut reader = reader_builder(delimiter).from_reader(input);
    let mut table = SealEventTable::default();

    for record in reader.deserialize::<SealEventRecord>() {
        let record = record?;
        if record.matched_haendler_bez.is_empty() {
            continue;
        }
        table.seal_firms.insert(record.matched_haendler_bez.clone());

        match parse_seal_date(&record.seal_date_str) {
            Some(seal_date) => table.events.push(SealChangeEvent {
                seal_firm_id: record.seal_firm_id,
                firm: record.matched_haendler_bez,
                seal_date,
            }),
            None => {
                let err = PanelError::MalformedSealDate {
                    firm: record.matched_haendler_bez,
                    raw: record.seal_date_str,
                };
                log::warn!("⚠️  {} (event skipped)", err);
                table.malformed += 1;
            }
        }
    }

    Ok(table)
}

pub fn load_allowed_firms(path: &Path, delimiter: u8) -> Result<HashSet<FirmId>, PanelError> {
    let file = std::fs::File::open(path)?;
    let firms = read_allowed_firms(file, delimiter)?;
    log::info!("📋 Loaded {} allowed firms from {}", firms.len(), path.display());
    Ok(firms)
}

pub fn read_allowed_firms<R: Read>(input: R, delimiter: u8) -> Result<HashSet<FirmId>, PanelError> {
    let mut reader = reader_builder(delimiter).from_reader(input);
    let mut firms = HashSet::new();
    for record in reader.deserialize::<AllowedFirmRecord>() {
        let record = record?;
        if !record.haendler_bez.is_empty() {
            firms.insert(record.haendler_bez);
        }
    }
    Ok(firms)
}
