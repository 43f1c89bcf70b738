//! Drives panel assembly over all seal events
//!
//! Two modes:
//! - sequential: events run one after another in input order
//! - pool: up to `max_workers` events in flight, completion order unspecified
//!
//! In both modes the assembler (and with it the store) is behind a single
//! async lease. A worker holds the lease while its event's windows are loaded
//! and queried, and releases it before emitting rows, so the store is never
//! mutated while another worker reads it. Per-event failures are logged and
//! counted; they never abort the run.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::assembler::PanelAssembler;
use super::error::PanelError;
use super::output_writer::PanelWriter;
use super::state::ProcessedFirmSet;
use super::types::SealChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorMode {
    Sequential,
    Pool { max_workers: usize },
}

impl CoordinatorMode {
    pub fn from_flags(parallel: bool, max_workers: usize) -> Self {
        if parallel {
            CoordinatorMode::Pool { max_workers: max_workers.max(1) }
        } else {
            CoordinatorMode::Sequential
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Written { rows: u64 },
    /// (firm, seal date) was already processed in this run
    Skipped,
}

/// Counts surfaced at the end of every run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub rows_written: u64,
}

impl RunSummary {
    fn record(&mut self, outcome: &Result<EventOutcome, PanelError>) {
        self.attempted += 1;
        match outcome {
            Ok(EventOutcome::Written { rows }) => {
                self.succeeded += 1;
                self.rows_written += rows;
            }
            Ok(EventOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Count seal-table rows dropped for an unparseable date as skipped events
    pub fn record_malformed(&mut self, malformed: usize) {
        self.attempted += malformed;
        self.skipped += malformed;
    }

    /// 0 when every event went through, 1 when at least one failed
    pub fn exit_code(&self) -> i32 {
        if self.failed == 0 {
            0
        } else {
            1
        }
    }

    pub fn log(&self) {
        log::info!("📊 Run summary:");
        log::info!("   ├─ Attempted: {}", self.attempted);
        log::info!("   ├─ Succeeded: {}", self.succeeded);
        log::info!("   ├─ Skipped: {}", self.skipped);
        log::info!("   ├─ Failed: {}", self.failed);
        log::info!("   └─ Rows written: {}", self.rows_written);
    }

    /// Write the summary as a JSON document, for run bookkeeping outside the logs
    pub fn write_json(&self, path: &Path) -> Result<(), PanelError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

type SharedWriter = Arc<Mutex<Box<dyn PanelWriter>>>;

pub struct ConcurrencyCoordinator {
    assembler: Arc<Mutex<PanelAssembler>>,
    writer: SharedWriter,
    processed: Arc<ProcessedFirmSet>,
    mode: CoordinatorMode,
    cancel: CancellationToken,
}

impl ConcurrencyCoordinator {
    pub fn new(assembler: PanelAssembler, writer: Box<dyn PanelWriter>, mode: CoordinatorMode) -> Self {
        Self {
            assembler: Arc::new(Mutex::new(assembler)),
            writer: Arc::new(Mutex::new(writer)),
            processed: Arc::new(ProcessedFirmSet::new()),
            mode,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop scheduling new events once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn processed(&self) -> &ProcessedFirmSet {
        &self.processed
    }

    pub async fn run(&self, events: Vec<SealChangeEvent>) -> RunSummary {
        log::info!("🚀 Assembling panel for {} seal events ({:?})", events.len(), self.mode);
        log::info!("   └─ Output backend: {}", self.writer.lock().await.backend_type());

        let summary = match self.mode {
            CoordinatorMode::Sequential => self.run_sequential(events).await,
            CoordinatorMode::Pool { max_workers } => self.run_pool(events, max_workers).await,
        };

        if let Err(e) = self.writer.lock().await.flush().await {
            log::error!("❌ Failed to flush panel output: {}", e);
        }
        summary
    }

    async fn run_sequential(&self, events: Vec<SealChangeEvent>) -> RunSummary {
        let mut summary = RunSummary::default();
        for event in events {
            if self.cancel.is_cancelled() {
                log::warn!("⚠️  Run cancelled, remaining events not scheduled");
                break;
            }
            let firm = event.firm.clone();
            let outcome = process_event(
                self.assembler.clone(),
                self.writer.clone(),
                self.processed.clone(),
                event,
            )
            .await;
            log_outcome(&firm, &outcome);
            summary.record(&outcome);
        }
        summary
    }

    async fn run_pool(&self, events: Vec<SealChangeEvent>, max_workers: usize) -> RunSummary {
        let permits = Arc::new(Semaphore::new(max_workers.max(1)));
        let mut handles = Vec::with_capacity(events.len());

        for event in events {
            if self.cancel.is_cancelled() {
                log::warn!("⚠️  Run cancelled, remaining events not scheduled");
                break;
            }
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let assembler = self.assembler.clone();
            let writer = self.writer.clone();
            let processed = self.processed.clone();
            let firm = event.firm.clone();
            let handle = tokio::spawn(async move {
                let outcome = process_event(assembler, writer, processed, event).await;
                drop(permit);
                outcome
            });
            handles.push((firm, handle));
        }

        let mut summary = RunSummary::default();
        for (firm, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => Err(PanelError::from(join_err)),
            };
            log_outcome(&firm, &outcome);
            summary.record(&outcome);
        }
        summary
    }
}

/// Prepare one event under the store lease, then stream its rows out per task
async fn process_event(
    assembler: Arc<Mutex<PanelAssembler>>,
    writer: SharedWriter,
    processed: Arc<ProcessedFirmSet>,
    event: SealChangeEvent,
) -> Result<EventOutcome, PanelError> {
    let lease = assembler.lock_owned().await;
    let plan = tokio::task::spawn_blocking(move || lease.assemble(&event, &processed)).await??;

    let Some(plan) = plan else {
        return Ok(EventOutcome::Skipped);
    };

    let mut rows_written = 0u64;
    for rows in plan.task_rows() {
        if rows.is_empty() {
            continue;
        }
        writer.lock().await.write_rows(&rows).await?;
        rows_written += rows.len() as u64;
    }
    Ok(EventOutcome::Written { rows: rows_written })
}

fn log_outcome(firm: &str, outcome: &Result<EventOutcome, PanelError>) {
    match outcome {
        Ok(EventOutcome::Written { rows }) => log::info!("   └─ ✅ '{}': {} rows written", firm, rows),
        Ok(EventOutcome::Skipped) => {}
        Err(e) => log::error!("❌ Seal event '{}' failed: {}", firm, e),
    }
}
