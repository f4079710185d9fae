//! Backup, replace and rollback of the installation directory.

use crate::error::{DlcError, IoContext, Result};
use crate::release::{wait_for_release, ReleaseCheck, ReleasePolicy};
use crate::update::log::UpdateLog;
use crate::update::UpdateStage;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub app_dir: PathBuf,
    pub staged_dir: PathBuf,
    pub backup_dir: PathBuf,
    /// Paths relative to `app_dir` that are never copied, deleted or replaced.
    pub preserve: Vec<PathBuf>,
}

impl InstallLayout {
    pub fn is_preserved(&self, rel: &Path) -> bool {
        self.preserve.iter().any(|p| rel.starts_with(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub backed_up: usize,
    pub replaced: Vec<PathBuf>,
}

/// Regular files under `root`, relative to it, sorted. Symlinks are skipped,
/// never followed, so nothing outside `root` is copied or replaced.
pub fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| {
            let path = err.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
            DlcError::io(path, err.into())
        })?;
        if entry.path_is_symlink() {
            warn!(path = %entry.path().display(), "symlink skipped");
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    Ok(out)
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).at(parent)?;
    }
    std::fs::copy(from, to).at(from)?;
    Ok(())
}

pub fn backup_installation(layout: &InstallLayout) -> Result<usize> {
    if layout.backup_dir.exists() {
        std::fs::remove_dir_all(&layout.backup_dir).at(&layout.backup_dir)?;
    }
    std::fs::create_dir_all(&layout.backup_dir).at(&layout.backup_dir)?;

    let mut count = 0;
    for rel in walk_files(&layout.app_dir)? {
        if layout.is_preserved(&rel) {
            continue;
        }
        copy_file(&layout.app_dir.join(&rel), &layout.backup_dir.join(&rel))?;
        count += 1;
    }
    info!(files = count, backup = %layout.backup_dir.display(), "installation backed up");
    Ok(count)
}

/// Installs every staged file over the installation. Each existing target is
/// only deleted once the release check says nobody holds it.
pub async fn replace_files(
    layout: &InstallLayout,
    policy: &ReleasePolicy,
    check: &dyn ReleaseCheck,
) -> Result<Vec<PathBuf>> {
    let mut replaced = Vec::new();
    for rel in walk_files(&layout.staged_dir)? {
        if layout.is_preserved(&rel) {
            warn!(file = %rel.display(), "package entry targets preserved data, skipped");
            continue;
        }
        let target = layout.app_dir.join(&rel);
        if target.exists() {
            wait_for_release(&target, policy, check).await?;
            if target.is_dir() {
                std::fs::remove_dir_all(&target).at(&target)?;
            } else {
                std::fs::remove_file(&target).at(&target)?;
            }
        }
        copy_file(&layout.staged_dir.join(&rel), &target)?;
        replaced.push(rel);
    }
    Ok(replaced)
}

/// Puts the installation back exactly as the backup recorded it. Preserved
/// paths and symlinks are left alone.
pub fn restore_from_backup(layout: &InstallLayout) -> Result<()> {
    if !layout.backup_dir.is_dir() {
        return Err(DlcError::NotFound(format!(
            "backup {} is missing",
            layout.backup_dir.display()
        )));
    }
    for entry in std::fs::read_dir(&layout.app_dir).at(&layout.app_dir)? {
        let entry = entry.at(&layout.app_dir)?;
        let rel = PathBuf::from(entry.file_name());
        if layout.is_preserved(&rel) {
            continue;
        }
        let path = entry.path();
        let kind = entry.file_type().at(&path)?;
        if kind.is_symlink() {
            continue;
        }
        if kind.is_dir() {
            clear_unpreserved(layout, &rel)?;
        } else {
            std::fs::remove_file(&path).at(&path)?;
        }
    }
    for rel in walk_files(&layout.backup_dir)? {
        copy_file(&layout.backup_dir.join(&rel), &layout.app_dir.join(&rel))?;
    }
    info!(app_dir = %layout.app_dir.display(), "installation restored from backup");
    Ok(())
}

fn clear_unpreserved(layout: &InstallLayout, rel: &Path) -> Result<()> {
    let dir = layout.app_dir.join(rel);
    if !layout.preserve.iter().any(|p| p.starts_with(rel)) {
        return std::fs::remove_dir_all(&dir).at(&dir);
    }
    for entry in std::fs::read_dir(&dir).at(&dir)? {
        let entry = entry.at(&dir)?;
        let child = rel.join(entry.file_name());
        if layout.is_preserved(&child) {
            continue;
        }
        let kind = entry.file_type().at(entry.path())?;
        if kind.is_symlink() {
            continue;
        }
        if kind.is_dir() {
            clear_unpreserved(layout, &child)?;
        } else {
            std::fs::remove_file(entry.path()).at(entry.path())?;
        }
    }
    Ok(())
}

/// Backing-up then Replacing. Any failure rolls the installation back and is
/// reported as `ReplacementFailed`, with `restored` telling whether the
/// installation is back to its previous state.
pub async fn apply_staged(
    layout: &InstallLayout,
    policy: &ReleasePolicy,
    check: &dyn ReleaseCheck,
    log: &UpdateLog,
) -> Result<ApplyReport> {
    log.info(
        "backing up installation",
        json!({ "stage": UpdateStage::BackingUp, "backup": layout.backup_dir }),
    );
    let backed_up = match backup_installation(layout) {
        Ok(count) => count,
        Err(err) => {
            log.error("backup failed, installation untouched", json!({ "error": err.to_string() }));
            return Err(DlcError::ReplacementFailed {
                reason: format!("backup failed: {err}"),
                restored: true,
            });
        }
    };

    log.info(
        "replacing files",
        json!({ "stage": UpdateStage::Replacing, "staged": layout.staged_dir, "backed_up": backed_up }),
    );
    match replace_files(layout, policy, check).await {
        Ok(replaced) => {
            log.info("files replaced", json!({ "count": replaced.len() }));
            Ok(ApplyReport {
                backed_up,
                replaced,
            })
        }
        Err(err) => {
            log.error("replacement failed, rolling back", json!({ "error": err.to_string() }));
            let restored = match restore_from_backup(layout) {
                Ok(()) => {
                    log.info("rollback complete", serde_json::Value::Null);
                    true
                }
                Err(restore_err) => {
                    error!(error = %restore_err, "rollback failed");
                    log.error("rollback failed", json!({ "error": restore_err.to_string() }));
                    false
                }
            };
            Err(DlcError::ReplacementFailed {
                reason: err.to_string(),
                restored,
            })
        }
    }
}
