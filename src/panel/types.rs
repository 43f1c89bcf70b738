//! Core data structures for panel construction

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::windows::{date_to_unix, format_seal_date};

/// Numeric product identifier (`produkt_id` in the partition files)
pub type ProductId = i64;

/// Retailer identifier (`haendler_bez` in the partition files)
pub type FirmId = String;

/// A listing spell: `product` offered by `firm` during `[interval_start, interval_end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub product_id: ProductId,
    pub firm_id: FirmId,
    pub interval_start: i64,
    pub interval_end: i64,
}

/// The date a firm first carried a trust seal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealChangeEvent {
    /// Identifier from the seal provider's listing
    pub seal_firm_id: String,
    /// Retailer name as matched against the partition data
    pub firm: FirmId,
    pub seal_date: NaiveDate,
}

impl SealChangeEvent {
    pub fn seal_unix(&self) -> i64 {
        date_to_unix(self.seal_date)
    }

    /// `DD.MM.YYYY` rendering, as used in the seal-event table
    pub fn seal_date_str(&self) -> String {
        format_seal_date(self.seal_date)
    }

    /// Key used for at-most-once processing
    pub fn processing_key(&self) -> (FirmId, NaiveDate) {
        (self.firm.clone(), self.seal_date)
    }
}

/// One (i, j, t) observation of the output panel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObservationRow {
    pub product_id: ProductId,
    pub firm_id: FirmId,
    pub week_running_var: i64,
    /// 1 for the seal-adopting firm's own rows, 0 for counterfactual firms
    pub treatment_flag: u8,
}
