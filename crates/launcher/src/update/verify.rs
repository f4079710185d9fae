//! Package checks and staging. Nothing here writes outside the download and
//! scratch directories.

use crate::error::{DlcError, IoContext, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub suffix: String,
    /// Main executable, relative to the package root.
    pub main_executable: PathBuf,
    pub required_entries: Vec<PathBuf>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPackage {
    pub path: PathBuf,
    /// Single top-level directory wrapping every entry, stripped on staging.
    pub root_prefix: Option<PathBuf>,
    pub entries: usize,
}

fn failed(msg: impl Into<String>) -> DlcError {
    DlcError::VerificationFailed(msg.into())
}

/// First file under `dir` (recursively, sorted) whose name ends in `suffix`.
pub fn find_package(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let suffix = suffix.to_ascii_lowercase();
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map_or(false, |n| n.to_ascii_lowercase().ends_with(&suffix))
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
        .into_iter()
        .next()
        .ok_or_else(|| failed(format!("no `{suffix}` package in {}", dir.display())))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).at(path)?;
    Ok(hex::encode(hasher.finalize()))
}

fn strip_root(name: &Path, root: Option<&Path>) -> Option<PathBuf> {
    match root {
        Some(root) => name.strip_prefix(root).ok().map(Path::to_path_buf),
        None => Some(name.to_path_buf()),
    }
    .filter(|p| !p.as_os_str().is_empty())
}

pub fn verify_package(download_dir: &Path, spec: &PackageSpec) -> Result<VerifiedPackage> {
    let path = find_package(download_dir, &spec.suffix)?;

    if let Some(expected) = &spec.sha256 {
        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(failed(format!(
                "sha256 mismatch for {}: expected {expected}, got {actual}",
                path.display()
            )));
        }
    }

    let file = File::open(&path).at(&path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| failed(format!("{} is not a readable archive: {e}", path.display())))?;
    if archive.len() == 0 {
        return Err(failed(format!("{} is empty", path.display())));
    }

    let mut files = Vec::with_capacity(archive.len());
    let mut tops = BTreeSet::new();
    let mut top_level_file = false;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| failed(format!("unreadable entry {i}: {e}")))?;
        let name = entry
            .enclosed_name()
            .ok_or_else(|| failed(format!("entry `{}` escapes the package root", entry.name())))?;
        if let Some(Component::Normal(first)) = name.components().next() {
            tops.insert(PathBuf::from(first));
        }
        if entry.is_file() {
            if name.components().count() == 1 {
                top_level_file = true;
            }
            files.push(name);
        }
    }

    let root_prefix = if tops.len() == 1 && !top_level_file {
        tops.into_iter().next()
    } else {
        None
    };
    let present: BTreeSet<PathBuf> = files
        .iter()
        .filter_map(|f| strip_root(f, root_prefix.as_deref()))
        .collect();

    for required in std::iter::once(&spec.main_executable).chain(spec.required_entries.iter()) {
        if !present.contains(required) {
            return Err(failed(format!(
                "{} is missing required entry {}",
                path.display(),
                required.display()
            )));
        }
    }

    info!(package = %path.display(), entries = files.len(), "package verified");
    Ok(VerifiedPackage {
        path,
        root_prefix,
        entries: files.len(),
    })
}

/// Extracts the package into `staged_dir`, which is emptied first. Returns the
/// staged files relative to `staged_dir`.
pub fn stage_package(package: &VerifiedPackage, staged_dir: &Path) -> Result<Vec<PathBuf>> {
    if staged_dir.exists() {
        std::fs::remove_dir_all(staged_dir).at(staged_dir)?;
    }
    std::fs::create_dir_all(staged_dir).at(staged_dir)?;

    let file = File::open(&package.path).at(&package.path)?;
    let mut archive = ZipArchive::new(file).map_err(|e| failed(e.to_string()))?;
    let mut staged = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| failed(e.to_string()))?;
        let Some(name) = entry.enclosed_name() else {
            return Err(failed(format!("entry `{}` escapes the package root", entry.name())));
        };
        let Some(rel) = strip_root(&name, package.root_prefix.as_deref()) else {
            continue;
        };
        let target = staged_dir.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&target).at(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        let mut out = File::create(&target).at(&target)?;
        io::copy(&mut entry, &mut out).at(&target)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode)).at(&target)?;
        }
        debug!(file = %rel.display(), "staged");
        staged.push(rel);
    }
    staged.sort();
    Ok(staged)
}
