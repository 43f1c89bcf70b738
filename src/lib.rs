//! # sealpanel
//!
//! Builds the (product, firm, week) index space used to study how trust-seal
//! adoption by a retailer changes the market visibility of its products.
//!
//! - `panel` - seal-event driven panel construction (windows, ingestion,
//!   sampling, continuity filter, assembly, coordination)
//! - `rendering` - derived variables on top of a finished panel

pub mod panel;
pub mod rendering;
