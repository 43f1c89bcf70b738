//! Append-only panel output
//!
//! The header is written once when the run starts; afterwards every task's
//! rows are appended and flushed right away, so a crashed run leaves a
//! consistent (if incomplete) file behind.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::error::PanelError;
use super::types::ObservationRow;

pub const PANEL_HEADER: [&str; 4] = ["product_id", "firm_id", "week_running_var", "treatment_flag"];

#[async_trait]
pub trait PanelWriter: Send {
    /// Append rows of one task
    async fn write_rows(&mut self, rows: &[ObservationRow]) -> Result<(), PanelError>;

    /// Flush pending writes to storage
    async fn flush(&mut self) -> Result<(), PanelError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

pub struct CsvPanelWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows_written: u64,
}

impl CsvPanelWriter {
    /// Truncate `path` and write the header row
    pub fn create(path: &Path) -> Result<Self, PanelError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(PANEL_HEADER)?;
        writer.flush()?;

        log::info!("📝 Writing panel rows to: {}", path.display());
        Ok(Self { path: path.to_path_buf(), writer, rows_written: 0 })
    }

    /// Append to an existing panel file without writing another header
    pub fn append(path: &Path) -> Result<Self, PanelError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        log::info!("📝 Appending panel rows to: {}", path.display());
        Ok(Self { path: path.to_path_buf(), writer, rows_written: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written through this handle
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

#[async_trait]
impl PanelWriter for CsvPanelWriter {
    async fn write_rows(&mut self, rows: &[ObservationRow]) -> Result<(), PanelError> {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        self.rows_written += rows.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), PanelError> {
        self.writer.flush()?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "CSV"
    }
}
