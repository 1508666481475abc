//! Persistence of the most recent scan.
//!
//! A single flat JSON file, so `skybox devices` can list what the last
//! sweep found without sweeping again.

use crate::scanner::ScanReport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "last_scan.json";

/// Persisted result of the last sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastScan {
    pub finished_at: DateTime<Utc>,
    pub report: ScanReport,
}

/// Get the path to the state file
pub fn get_state_path() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .context("Could not find data directory")?;

    Ok(data_dir.join("skybox").join(STATE_FILE))
}

/// Load the last scan from `path`; `None` if nothing was saved yet.
pub fn load_from(path: &Path) -> Result<Option<LastScan>> {
    if !path.exists() {
        tracing::debug!("No state file found at {:?}", path);
        return Ok(None);
    }

    let content = std::fs::read_to_string(path).context("Failed to read state file")?;
    let last: LastScan = serde_json::from_str(&content).context("Failed to parse state file")?;

    tracing::debug!(
        "Loaded last scan from {}: {} devices",
        last.finished_at.to_rfc3339(),
        last.report.devices.len()
    );
    Ok(Some(last))
}

/// Save `report` as the last scan at `path`.
pub fn save_to(path: &Path, report: &ScanReport) -> Result<LastScan> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).context("Failed to create app data directory")?;
    }

    let last = LastScan {
        finished_at: Utc::now(),
        report: report.clone(),
    };
    let content = serde_json::to_string_pretty(&last).context("Failed to serialize scan")?;
    std::fs::write(path, content).context("Failed to write state file")?;

    tracing::debug!("Saved last scan: {} devices", report.devices.len());
    Ok(last)
}

/// Delete the saved scan, if any.
pub fn clear_at(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).context("Failed to delete state file")?;
        tracing::info!("Cleared persisted scan file");
    }
    Ok(())
}

pub fn load_last_scan() -> Result<Option<LastScan>> {
    load_from(&get_state_path()?)
}

pub fn save_last_scan(report: &ScanReport) -> Result<LastScan> {
    save_to(&get_state_path()?, report)
}

pub fn clear_last_scan() -> Result<()> {
    clear_at(&get_state_path()?)
}
