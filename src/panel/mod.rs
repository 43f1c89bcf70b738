//! # Seal-Event Panel Construction
//!
//! Builds the (product, firm, week) index space one seal event at a time:
//! 1. Resolve the weekly offer and monthly click partitions around the seal date
//! 2. Load them into the store (skipping partitions already in the ingestion log)
//! 3. Pick candidate products (top clicks or seeded random sample)
//! 4. Admit products listed in nearly every week around the seal date
//! 5. Add up to N counterfactual firms per admitted product
//! 6. Emit one row per week each (product, firm) pair was offered
//!
//! ## Memory
//!
//! Only the current event's windows are resident. A relation is freed (rows
//! deleted, table dropped, log entries purged) when its policy says so, then
//! the run pauses until the process has handed memory back.
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (Offer, SealChangeEvent, ObservationRow)
//! - `windows` - Running variable and partition window arithmetic
//! - `query` - Typed SELECT builder and query criteria
//! - `db` - Store handle and schema migrations
//! - `ingestion` - Windowed partition loading and table policies
//! - `reclaim` - Recovery pause after a free
//! - `sampling` - Product and counterfactual-firm samplers
//! - `continuity` - Admission filter
//! - `assembler` - Per-event task plans
//! - `coordinator` - Sequential / worker-pool driver
//! - `seal_events` - Seal-event table and allowed-firm list
//! - `output_writer` - Panel output backends

pub mod assembler;
pub mod config;
pub mod continuity;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod output_writer;
pub mod query;
pub mod reclaim;
pub mod sampling;
pub mod seal_events;
pub mod state;
pub mod types;
pub mod windows;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use assembler::{EventPlan, PanelAssembler};
pub use config::PanelConfig;
pub use coordinator::{ConcurrencyCoordinator, CoordinatorMode, RunSummary};
pub use db::{PanelStore, Relation, StoreSettings};
pub use error::{ConfigError, PanelError};
pub use output_writer::{CsvPanelWriter, PanelWriter};
pub use types::{ObservationRow, Offer, SealChangeEvent};
