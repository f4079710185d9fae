//! Descriptor files on disk and the startup restore pass.
//!
//! Layout: `<content_root>/<content_id>/<version>/<info_hash>.descriptor`.
//! A descriptor is only re-attached when the manifest lists its hash at that
//! exact location and real payload files sit beside it.

use crate::error::{IoContext, Result};
use crate::registry::{AttachOutcome, TransferRegistry};
use dlc_protocol::{ContentId, InfoHash};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DESCRIPTOR_EXT: &str = "descriptor";

pub fn descriptor_path(content_root: &Path, id: ContentId, version: &str, hash: &InfoHash) -> PathBuf {
    content_root
        .join(id.as_str())
        .join(version)
        .join(format!("{hash}.{DESCRIPTOR_EXT}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    AlreadyPresent,
}

/// Writes the descriptor once. An existing file is never overwritten.
pub fn save_descriptor(dir: &Path, hash: &InfoHash, bytes: &[u8]) -> Result<SaveOutcome> {
    let path = dir.join(format!("{hash}.{DESCRIPTOR_EXT}"));
    if path.exists() {
        return Ok(SaveOutcome::AlreadyPresent);
    }
    std::fs::create_dir_all(dir).at(dir)?;
    let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return Ok(SaveOutcome::AlreadyPresent)
        }
        Err(err) => return Err(crate::error::DlcError::io(&path, err)),
    };
    file.write_all(bytes).at(&path)?;
    file.sync_all().at(&path)?;
    debug!(path = %path.display(), "descriptor saved");
    Ok(SaveOutcome::Written)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BadFileName,
    NotInIndex,
    Misplaced,
    NoPayload,
    AlreadyRegistered,
    Unreadable,
    HashMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredTransfer {
    pub info_hash: InfoHash,
    pub content_id: ContentId,
    pub version: String,
    pub seeding: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<RestoredTransfer>,
    pub rejected: Vec<(PathBuf, RejectReason)>,
}

fn sub_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.file_name() != ".git")
        .map(|e| e.into_path())
        .collect();
    dirs.sort();
    dirs
}

fn is_descriptor(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == DESCRIPTOR_EXT)
}

fn has_payload(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|read| {
            read.filter_map(|e| e.ok())
                .any(|e| !is_descriptor(&e.path()))
        })
        .unwrap_or(false)
}

/// Re-attaches every eligible descriptor under the content root, paused.
/// Finished transfers are switched to seeding.
pub async fn restore_all(registry: &TransferRegistry) -> Result<RestoreReport> {
    let index = registry.index();
    let mut report = RestoreReport::default();

    for id_dir in sub_dirs(registry.content_root()) {
        for version_dir in sub_dirs(&id_dir) {
            let Ok(read) = std::fs::read_dir(&version_dir) else {
                continue;
            };
            let mut descriptors: Vec<PathBuf> = read
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_descriptor(p))
                .collect();
            descriptors.sort();

            for path in descriptors {
                let mut reject = |reason: RejectReason| {
                    warn!(path = %path.display(), ?reason, "descriptor not restored");
                    report.rejected.push((path.clone(), reason));
                };

                let Some(hash) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| InfoHash::parse(s).ok())
                else {
                    reject(RejectReason::BadFileName);
                    continue;
                };
                let Some(resolved) = index.resolve_hash(&hash) else {
                    reject(RejectReason::NotInIndex);
                    continue;
                };
                if descriptor_path(registry.content_root(), resolved.content_id, &resolved.version, &hash)
                    != path
                {
                    reject(RejectReason::Misplaced);
                    continue;
                }
                if !has_payload(&version_dir) {
                    reject(RejectReason::NoPayload);
                    continue;
                }
                if registry.contains(&hash).await {
                    reject(RejectReason::AlreadyRegistered);
                    continue;
                }
                let Ok(bytes) = std::fs::read(&path) else {
                    reject(RejectReason::Unreadable);
                    continue;
                };
                match registry.inspect(&bytes).await {
                    Ok(found) if found == hash => {}
                    Ok(_) => {
                        reject(RejectReason::HashMismatch);
                        continue;
                    }
                    Err(_) => {
                        reject(RejectReason::Unreadable);
                        continue;
                    }
                }

                match registry
                    .attach_descriptor(bytes, &hash, resolved.content_id, &resolved.version)
                    .await?
                {
                    AttachOutcome::Attached { seeding } => {
                        info!(info_hash = %hash, content_id = %resolved.content_id, version = %resolved.version, seeding, "transfer restored");
                        report.restored.push(RestoredTransfer {
                            info_hash: hash,
                            content_id: resolved.content_id,
                            version: resolved.version,
                            seeding,
                        });
                    }
                    AttachOutcome::AlreadyRegistered => reject(RejectReason::AlreadyRegistered),
                }
            }
        }
    }

    Ok(report)
}
