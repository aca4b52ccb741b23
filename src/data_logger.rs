//! Periodic CSV data logging.
//!
//! Every interval the logger appends one row holding the loggable fields of every widget plus
//! the automation group. Columns are fixed by the first row; widgets that disappear later
//! leave their cells empty. Appending to an existing, non-empty file never repeats the header.

use crate::dashboard::Dashboard;
use crate::error::{AppResult, PanelError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[cfg(feature = "storage_csv")]
use std::fs::{File, OpenOptions};

/// Group name used for automation columns.
pub const AUTOMATION_GROUP: &str = "Automation";

/// One logged column: group (widget nickname) and field name.
type Column = (String, String);

/// Appends dashboard snapshots to a CSV file.
#[cfg(feature = "storage_csv")]
pub struct CsvLogger {
    path: PathBuf,
    interval: Duration,
    next_record: Instant,
    writer: csv::Writer<File>,
    needs_header: bool,
    columns: Option<Vec<Column>>,
    rows: u64,
}

/// Stand-in used when the `storage_csv` feature is off. Creating one always fails.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvLogger;

fn logging_error(path: &Path, err: impl std::fmt::Display) -> PanelError {
    PanelError::Logging(format!("{}: {}", path.display(), err))
}

#[cfg(feature = "storage_csv")]
impl CsvLogger {
    /// Open `path` for appending. The first row is due at `now`.
    pub fn create(path: impl Into<PathBuf>, interval: Duration, now: Instant) -> AppResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| logging_error(&path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| logging_error(&path, e))?;
        let needs_header = file.metadata().map_err(|e| logging_error(&path, e))?.len() == 0;

        info!("Logging data to '{}' every {:?}", path.display(), interval);
        Ok(Self {
            writer: csv::WriterBuilder::new().from_writer(file),
            path,
            interval,
            next_record: now,
            needs_header,
            columns: None,
            rows: 0,
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written since creation.
    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Whether the next row is due.
    pub fn due(&self, now: Instant) -> bool {
        now >= self.next_record
    }

    /// Append one row and schedule the next.
    pub fn record(
        &mut self,
        now: Instant,
        dashboard: &Dashboard,
        automation_log: Vec<(String, String)>,
    ) -> AppResult<()> {
        self.next_record = now + self.interval;

        let mut groups = dashboard.log_data();
        if !automation_log.is_empty() {
            groups.push((AUTOMATION_GROUP.to_string(), automation_log));
        }

        let columns = self.columns.get_or_insert_with(|| {
            groups
                .iter()
                .flat_map(|(group, fields)| {
                    fields.iter().map(move |(field, _)| (group.clone(), field.clone()))
                })
                .collect()
        });

        if self.needs_header {
            let header = ["Date".to_string(), "Timestamp".to_string()]
                .into_iter()
                .chain(columns.iter().map(|(group, field)| format!("{}: {}", group, field)));
            self.writer
                .write_record(header)
                .map_err(|e| logging_error(&self.path, e))?;
            self.needs_header = false;
        }

        let stamp = chrono::Local::now();
        let row = [
            stamp.format("%m/%d/%Y").to_string(),
            stamp.format("%H:%M:%S").to_string(),
        ]
        .into_iter()
        .chain(columns.iter().map(|(group, field)| {
            groups
                .iter()
                .find(|(g, _)| g == group)
                .and_then(|(_, fields)| fields.iter().find(|(f, _)| f == field))
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        }));
        self.writer
            .write_record(row)
            .map_err(|e| logging_error(&self.path, e))?;
        self.writer.flush().map_err(|e| logging_error(&self.path, e))?;

        self.rows += 1;
        debug!("Logged row {} to '{}'", self.rows, self.path.display());
        Ok(())
    }
}

#[cfg(not(feature = "storage_csv"))]
impl CsvLogger {
    /// Always fails with [`PanelError::FeatureNotEnabled`].
    pub fn create(path: impl Into<PathBuf>, _interval: Duration, _now: Instant) -> AppResult<Self> {
        let _ = path.into();
        Err(PanelError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// Empty path.
    pub fn path(&self) -> &Path {
        Path::new("")
    }

    /// Always 0.
    pub fn rows_written(&self) -> u64 {
        0
    }

    /// Never due.
    pub fn due(&self, _now: Instant) -> bool {
        false
    }

    /// Always fails with [`PanelError::FeatureNotEnabled`].
    pub fn record(
        &mut self,
        _now: Instant,
        _dashboard: &Dashboard,
        _automation_log: Vec<(String, String)>,
    ) -> AppResult<()> {
        Err(PanelError::FeatureNotEnabled("storage_csv".to_string()))
    }
}
