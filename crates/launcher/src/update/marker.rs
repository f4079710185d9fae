use crate::error::{IoContext, Result};
use dlc_protocol::UpdateReport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MARKER_FILE: &str = "pending-update.json";
const REPORT_FILE: &str = "last-update.json";

/// Written right before hand-off; removed by the helper when it finishes.
/// Finding one at startup means an earlier attempt died mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMarker {
    pub target_version: String,
    pub created_at: String,
    pub pid: u32,
}

impl PendingMarker {
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            target_version: target_version.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
        }
    }

    pub fn path(scratch_dir: &Path) -> PathBuf {
        scratch_dir.join(MARKER_FILE)
    }

    pub fn write(&self, scratch_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(scratch_dir).at(scratch_dir)?;
        let path = Self::path(scratch_dir);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?).at(&path)
    }

    pub fn clear(scratch_dir: &Path) {
        let path = Self::path(scratch_dir);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove pending-update marker");
            }
        }
    }

    /// Deletes a leftover marker. Its contents are reported but never acted on.
    pub fn discard_stale(scratch_dir: &Path) -> Option<PendingMarker> {
        let path = Self::path(scratch_dir);
        if !path.exists() {
            return None;
        }
        let parsed = std::fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<PendingMarker>(&raw).ok());
        warn!(
            path = %path.display(),
            target_version = parsed.as_ref().map(|m| m.target_version.as_str()).unwrap_or("<unreadable>"),
            "discarding stale pending-update marker"
        );
        Self::clear(scratch_dir);
        parsed
    }
}

pub fn report_path(state_dir: &Path) -> PathBuf {
    state_dir.join(REPORT_FILE)
}

pub fn write_report(state_dir: &Path, report: &UpdateReport) -> Result<()> {
    std::fs::create_dir_all(state_dir).at(state_dir)?;
    let path = report_path(state_dir);
    std::fs::write(&path, serde_json::to_vec_pretty(report)?).at(&path)?;
    info!(path = %path.display(), "update report written");
    Ok(())
}

/// Reads and deletes the report left by the previous helper run.
pub fn take_report(state_dir: &Path) -> Option<UpdateReport> {
    let path = report_path(state_dir);
    let raw = std::fs::read(&path).ok()?;
    if let Err(err) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %err, "failed to remove update report");
    }
    match serde_json::from_slice(&raw) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable update report");
            None
        }
    }
}
