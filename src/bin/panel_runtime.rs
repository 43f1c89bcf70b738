//! Panel Runtime - seal-event panel construction
//!
//! This binary runs one full panel build:
//! - Opens the store (durable ingestion log survives restarts)
//! - Reads the seal-event table and the allowed-firm list
//! - Assembles every event sequentially or with a worker pool
//! - Appends the panel rows to the output CSV
//!
//! Usage:
//!   cargo run --release --bin panel_runtime
//!
//! Environment variables: see `PanelConfig::from_env`. The most common ones:
//!   PANEL_DB_PATH - SQLite store path (default: panel_store.db)
//!   PANEL_DATA_DIR - Partition root (default: ./data)
//!   PANEL_SEAL_EVENTS_PATH - Seal-event table (default: ./data/final_matrix.csv)
//!   PANEL_OUTPUT_PATH - Panel output (default: results.csv)
//!   PANEL_PARALLEL / MAX_WORKERS - Worker pool (default: false / 10)
//!
//! Exit codes: 0 all events succeeded, 1 some events failed, 2 startup failed.

use dotenv::dotenv;
use env_logger::Env;
use log::{error, info, warn};
use sealpanel::panel::{
    reclaim::{MemoryProbe, ProcessMemoryProbe},
    seal_events::{load_allowed_firms, load_seal_events},
    ConcurrencyCoordinator, CoordinatorMode, CsvPanelWriter, PanelAssembler, PanelConfig, PanelError, PanelStore,
    StoreSettings,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const STARTUP_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    info!("🚀 Panel Runtime");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("❌ Startup failed: {}", e);
            STARTUP_FAILURE
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32, PanelError> {
    let config = PanelConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Store: {}", config.db_path);
    info!("   ├─ Data dir: {}", config.data_dir.display());
    info!("   ├─ Seal events: {}", config.seal_events_path.display());
    info!("   ├─ Output: {}", config.output_path.display());
    info!(
        "   ├─ Offer window: -{}w / +{}w, click window: -{}m / +{}m",
        config.offer_weeks_pre, config.offer_weeks_post, config.click_months_pre, config.click_months_post
    );
    info!("   ├─ Product selection: {:?}", config.product_selection);
    info!(
        "   ├─ Continuity: ±{}w, {} missing allowed",
        config.continuity_weeks, config.continuity_missing_weeks_allowed
    );
    info!("   └─ Counterfactuals per product: {}", config.counterfactual_sample_size);

    // Initialize store
    info!("🔧 Opening store...");
    let store = PanelStore::open(
        &config.db_path,
        &StoreSettings { memory_cap_bytes: config.store_memory_cap_bytes, threads: config.store_threads },
    )?;

    let table = load_seal_events(&config.seal_events_path, config.csv_delimiter)?;
    if table.events.is_empty() {
        warn!("⚠️  No seal events to process");
    }

    let allowed_firms = match load_allowed_firms(&config.allowed_firms_path, config.csv_delimiter) {
        Ok(firms) => Some(Arc::new(firms)),
        Err(e) if config.require_allowed_counterfactuals => return Err(e),
        Err(e) => {
            warn!("⚠️  Allowed-firm list not loaded: {}", e);
            None
        }
    };

    // CTRL+C stops scheduling new events and aborts recovery pauses
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("");
                info!("⚠️  Received CTRL+C, finishing in-flight events...");
                signal_cancel.cancel();
            }
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
    });

    let probe: Arc<dyn MemoryProbe> = Arc::new(ProcessMemoryProbe::new());
    let assembler = PanelAssembler::from_config(
        &config,
        store,
        Arc::new(table.seal_firms),
        allowed_firms,
        probe,
        cancel.clone(),
    );

    if let Some(path) = &config.scraper_ips_path {
        assembler.ingestion().load_scraper_ips(path)?;
    }

    let writer = CsvPanelWriter::create(&config.output_path)?;
    let mode = CoordinatorMode::from_flags(config.parallel, config.max_workers);
    let coordinator =
        ConcurrencyCoordinator::new(assembler, Box::new(writer), mode).with_cancellation(cancel);

    let mut summary = coordinator.run(table.events).await;
    summary.record_malformed(table.malformed);
    summary.log();

    let summary_path = config.output_path.with_extension("summary.json");
    if let Err(e) = summary.write_json(&summary_path) {
        warn!("⚠️  Failed to write run summary to {}: {}", summary_path.display(), e);
    }

    info!("✅ Panel runtime stopped");
    Ok(summary.exit_code())
}
