//! Run report: one CSV row per processed address.
//!
//! The file is opened in append mode for every row, so a crash mid-run keeps
//! the outcomes recorded so far.

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::address::Job;
use crate::automation::state::AddressOutcome;

const HEADER: [&str; 8] = [
    "district",
    "index",
    "address",
    "filename",
    "status",
    "detail",
    "elapsed_s",
    "finished_at",
];

pub struct RunReport {
    path: PathBuf,
}

impl RunReport {
    /// Creates `<log_dir>/runs/<timestamp>.csv`.
    pub fn create(log_dir: &Path) -> Result<Self> {
        let runs_dir = log_dir.join("runs");
        fs::create_dir_all(&runs_dir)
            .with_context(|| format!("Failed to create {}", runs_dir.display()))?;
        let path = runs_dir.join(format!("{}.csv", Local::now().format("%Y%m%d_%H%M%S")));
        Self::open(path)
    }

    /// Uses `path`, writing the header unless the file already has content.
    pub fn open(path: PathBuf) -> Result<Self> {
        let has_content = fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        if !has_content {
            let mut writer =
                csv::Writer::from_path(&path).context("Failed to create report CSV")?;
            writer.write_record(HEADER)?;
            writer.flush()?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, job: &Job, outcome: &AddressOutcome, elapsed: Duration) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .context("Failed to open report CSV for append")?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let index = job.index.to_string();
        let elapsed = format!("{:.1}", elapsed.as_secs_f64());
        let finished_at = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        writer
            .write_record([
                job.district.as_str(),
                index.as_str(),
                job.address.as_str(),
                job.filename.as_str(),
                outcome.status(),
                outcome.detail(),
                elapsed.as_str(),
                finished_at.as_str(),
            ])
            .context("Failed to write report row")?;
        writer.flush()?;
        Ok(())
    }
}
