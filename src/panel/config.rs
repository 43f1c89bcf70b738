//! Panel configuration from environment variables
//!
//! Every option has a default matching the production run, so an empty
//! environment yields a usable configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;
use super::windows::WindowResolver;

/// How candidate products of a seal firm are chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductSelection {
    /// Most clicked products of the firm around the seal date
    TopClicks,
    /// Deterministic random sample of the firm's offered products
    Random,
}

impl std::str::FromStr for ProductSelection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "top_clicks" | "top-clicks" | "clicks" => Ok(ProductSelection::TopClicks),
            "random" => Ok(ProductSelection::Random),
            other => Err(ConfigError::InvalidValue(format!(
                "PRODUCT_SELECTION must be 'top_clicks' or 'random', got '{}'",
                other
            ))),
        }
    }
}

/// Drop/reload policy of one windowed relation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePolicy {
    /// Free the relation before every event's load
    pub drop_after_use: bool,
    /// Free once the relation holds more rows than this
    pub row_limit: Option<u64>,
    /// Free once the oldest load is older than this
    pub cache_duration: Option<Duration>,
}

/// Timeout-bounded wait for the process to hand memory back after a free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Resident set size to wait for; `None` only samples once
    pub rss_target_bytes: Option<u64>,
}

/// Configuration for one panel run
#[derive(Debug, Clone)]
pub struct PanelConfig {
    /// SQLite store file (holds the durable ingestion log)
    pub db_path: String,
    /// Root directory of the partition folders
    pub data_dir: PathBuf,
    /// Offer partition folders, searched in order
    pub offer_folders: Vec<String>,
    pub click_folder: String,
    pub seal_events_path: PathBuf,
    pub allowed_firms_path: PathBuf,
    pub scraper_ips_path: Option<PathBuf>,
    /// Delimiter of the seal-event and allowed-firm tables
    pub csv_delimiter: u8,
    pub output_path: PathBuf,

    pub offer_weeks_pre: u32,
    pub offer_weeks_post: u32,
    pub click_months_pre: u32,
    pub click_months_post: u32,

    pub product_selection: ProductSelection,
    pub product_sample_size: usize,
    pub top_products_by_clicks: usize,
    pub counterfactual_sample_size: usize,
    pub sampler_seed: u64,

    pub continuity_weeks: u32,
    pub continuity_missing_weeks_allowed: u32,

    /// Counterfactual firms must also appear on the allowed-firm list
    pub require_allowed_counterfactuals: bool,
    pub exclude_scraper_clicks: bool,

    pub parallel: bool,
    pub max_workers: usize,

    pub offer_policy: TablePolicy,
    pub click_policy: TablePolicy,

    pub store_memory_cap_bytes: Option<u64>,
    pub store_threads: u32,

    pub recovery: RecoveryConfig,
}

fn parse_or<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn parse_opt<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

const MB: u64 = 1024 * 1024;

impl PanelConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (defaults in parentheses):
    /// - `PANEL_DB_PATH` (panel_store.db)
    /// - `PANEL_DATA_DIR` (./data)
    /// - `PANEL_OFFER_FOLDERS` (angebot_06_10,angebot_11_15,angebot)
    /// - `PANEL_CLICK_FOLDER` (clicks)
    /// - `PANEL_SEAL_EVENTS_PATH` (./data/final_matrix.csv)
    /// - `PANEL_ALLOWED_FIRMS_PATH` (./data/filtered_haendler_bez.csv)
    /// - `PANEL_SCRAPER_IPS_PATH` (./data/scrapper_ips.parquet, empty disables)
    /// - `PANEL_CSV_DELIMITER` (;)
    /// - `PANEL_OUTPUT_PATH` (results.csv)
    /// - `OFFER_WEEKS_PRE` / `OFFER_WEEKS_POST` (52 / 26)
    /// - `CLICK_MONTHS_PRE` / `CLICK_MONTHS_POST` (6 / 6)
    /// - `PRODUCT_SELECTION` (top_clicks)
    /// - `PRODUCT_SAMPLE_SIZE` (50), `TOP_PRODUCTS_BY_CLICKS` (200)
    /// - `COUNTERFACTUAL_SAMPLE_SIZE` (10), `SAMPLER_SEED` (42)
    /// - `CONTINUITY_WEEKS` (8), `CONTINUITY_MISSING_WEEKS_ALLOWED` (1)
    /// - `REQUIRE_ALLOWED_COUNTERFACTUALS` (false), `EXCLUDE_SCRAPER_CLICKS` (true)
    /// - `PANEL_PARALLEL` (false), `MAX_WORKERS` (10)
    /// - `OFFER_ROW_LIMIT` (2000000), `OFFER_CACHE_MINUTES` (60)
    /// - `CLICK_ROW_LIMIT` (500000), `CLICK_CACHE_MINUTES` (30)
    /// - `FREE_BETWEEN_EVENTS` (true)
    /// - `STORE_MEMORY_CAP_MB` (unset), `STORE_THREADS` (8)
    /// - `RECOVERY_TIMEOUT_SECS` (60), `RECOVERY_POLL_MS` (1000), `RECOVERY_RSS_TARGET_MB` (unset)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let free_between_events = parse_or(&lookup, "FREE_BETWEEN_EVENTS", true);

        let data_dir = PathBuf::from(lookup("PANEL_DATA_DIR").unwrap_or_else(|| "./data".to_string()));

        let offer_folders = lookup("PANEL_OFFER_FOLDERS")
            .unwrap_or_else(|| "angebot_06_10,angebot_11_15,angebot".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let scraper_ips_path = match lookup("PANEL_SCRAPER_IPS_PATH") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from("./data/scrapper_ips.parquet")),
        };

        let csv_delimiter = lookup("PANEL_CSV_DELIMITER")
            .and_then(|s| s.bytes().next())
            .unwrap_or(b';');

        Self {
            db_path: lookup("PANEL_DB_PATH").unwrap_or_else(|| "panel_store.db".to_string()),
            data_dir,
            offer_folders,
            click_folder: lookup("PANEL_CLICK_FOLDER").unwrap_or_else(|| "clicks".to_string()),
            seal_events_path: PathBuf::from(
                lookup("PANEL_SEAL_EVENTS_PATH").unwrap_or_else(|| "./data/final_matrix.csv".to_string()),
            ),
            allowed_firms_path: PathBuf::from(
                lookup("PANEL_ALLOWED_FIRMS_PATH")
                    .unwrap_or_else(|| "./data/filtered_haendler_bez.csv".to_string()),
            ),
            scraper_ips_path,
            csv_delimiter,
            output_path: PathBuf::from(lookup("PANEL_OUTPUT_PATH").unwrap_or_else(|| "results.csv".to_string())),

            offer_weeks_pre: parse_or(&lookup, "OFFER_WEEKS_PRE", 52),
            offer_weeks_post: parse_or(&lookup, "OFFER_WEEKS_POST", 26),
            click_months_pre: parse_or(&lookup, "CLICK_MONTHS_PRE", 6),
            click_months_post: parse_or(&lookup, "CLICK_MONTHS_POST", 6),

            product_selection: lookup("PRODUCT_SELECTION")
                .and_then(|s| match s.parse() {
                    Ok(selection) => Some(selection),
                    Err(e) => {
                        log::warn!("{}, defaulting to top_clicks", e);
                        None
                    }
                })
                .unwrap_or(ProductSelection::TopClicks),
            product_sample_size: parse_or(&lookup, "PRODUCT_SAMPLE_SIZE", 50),
            top_products_by_clicks: parse_or(&lookup, "TOP_PRODUCTS_BY_CLICKS", 200),
            counterfactual_sample_size: parse_or(&lookup, "COUNTERFACTUAL_SAMPLE_SIZE", 10),
            sampler_seed: parse_or(&lookup, "SAMPLER_SEED", 42),

            continuity_weeks: parse_or(&lookup, "CONTINUITY_WEEKS", 8),
            continuity_missing_weeks_allowed: parse_or(&lookup, "CONTINUITY_MISSING_WEEKS_ALLOWED", 1),

            require_allowed_counterfactuals: parse_or(&lookup, "REQUIRE_ALLOWED_COUNTERFACTUALS", false),
            exclude_scraper_clicks: parse_or(&lookup, "EXCLUDE_SCRAPER_CLICKS", true),

            parallel: parse_or(&lookup, "PANEL_PARALLEL", false),
            max_workers: parse_or(&lookup, "MAX_WORKERS", 10),

            offer_policy: TablePolicy {
                drop_after_use: free_between_events,
                row_limit: Some(parse_or(&lookup, "OFFER_ROW_LIMIT", 2_000_000)),
                cache_duration: Some(Duration::from_secs(60 * parse_or(&lookup, "OFFER_CACHE_MINUTES", 60))),
            },
            click_policy: TablePolicy {
                drop_after_use: free_between_events,
                row_limit: Some(parse_or(&lookup, "CLICK_ROW_LIMIT", 500_000)),
                cache_duration: Some(Duration::from_secs(60 * parse_or(&lookup, "CLICK_CACHE_MINUTES", 30))),
            },

            store_memory_cap_bytes: parse_opt::<u64>(&lookup, "STORE_MEMORY_CAP_MB").map(|mb| mb * MB),
            store_threads: parse_or(&lookup, "STORE_THREADS", 8),

            recovery: RecoveryConfig {
                timeout: Duration::from_secs(parse_or(&lookup, "RECOVERY_TIMEOUT_SECS", 60)),
                poll_interval: Duration::from_millis(parse_or(&lookup, "RECOVERY_POLL_MS", 1_000)),
                rss_target_bytes: parse_opt::<u64>(&lookup, "RECOVERY_RSS_TARGET_MB").map(|mb| mb * MB),
            },
        }
    }

    /// Reject configurations that cannot produce a panel
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue("MAX_WORKERS must be at least 1".to_string()));
        }
        if self.offer_folders.is_empty() {
            return Err(ConfigError::InvalidValue(
                "PANEL_OFFER_FOLDERS must name at least one folder".to_string(),
            ));
        }
        if self.product_selection == ProductSelection::Random && self.product_sample_size == 0 {
            return Err(ConfigError::InvalidValue("PRODUCT_SAMPLE_SIZE must be positive".to_string()));
        }
        if self.product_selection == ProductSelection::TopClicks && self.top_products_by_clicks == 0 {
            return Err(ConfigError::InvalidValue("TOP_PRODUCTS_BY_CLICKS must be positive".to_string()));
        }
        if self.recovery.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue("RECOVERY_POLL_MS must be positive".to_string()));
        }
        if self.continuity_weeks < 4 {
            log::warn!(
                "⚠️  CONTINUITY_WEEKS={} is below 4: every candidate product will be rejected",
                self.continuity_weeks
            );
        }
        Ok(())
    }

    pub fn window_resolver(&self) -> WindowResolver {
        WindowResolver {
            offer_weeks_pre: self.offer_weeks_pre,
            offer_weeks_post: self.offer_weeks_post,
            click_months_pre: self.click_months_pre,
            click_months_post: self.click_months_post,
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
