//! Detects when the OS has let go of a file.
//!
//! A self-rename through a hidden, per-attempt sibling name only succeeds when no process
//! holds a conflicting handle, which is a stronger signal than a read check on
//! platforms where open handles still permit reads.

use crate::error::{DlcError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleasePolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 200,
            max_delay_ms: 2000,
        }
    }
}

impl ReleasePolicy {
    /// Sleep inserted before each retry: doubles from the initial delay and
    /// saturates at the maximum.
    pub fn delays(&self) -> Vec<Duration> {
        let cap = self.max_delay_ms.max(self.initial_delay_ms);
        let mut next = self.initial_delay_ms;
        (0..self.max_retries)
            .map(|_| {
                let current = next.min(cap);
                next = current.saturating_mul(2).min(cap);
                Duration::from_millis(current)
            })
            .collect()
    }
}

pub trait ReleaseCheck: Send + Sync {
    fn is_accessible(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenameCheck;

impl ReleaseCheck for RenameCheck {
    fn is_accessible(&self, path: &Path) -> bool {
        is_accessible(path)
    }
}

const SWAP_EXT: &str = "dlcswap";

static SWAP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hidden sibling `.{name}.{pid}.{seq}.dlcswap`, unique per attempt so it can
/// never collide with a file somebody else owns.
fn swap_path(path: &Path, name: &str) -> PathBuf {
    let seq = SWAP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{seq}.{SWAP_EXT}", std::process::id()))
}

fn is_swap_name(candidate: &str, name: &str) -> bool {
    let Some(middle) = candidate
        .strip_prefix('.')
        .and_then(|r| r.strip_prefix(name))
        .and_then(|r| r.strip_prefix('.'))
        .and_then(|r| r.strip_suffix(SWAP_EXT))
        .and_then(|r| r.strip_suffix('.'))
    else {
        return false;
    };
    let mut parts = middle.split('.');
    let numeric = |p: Option<&str>| p.map_or(false, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    numeric(parts.next()) && numeric(parts.next()) && parts.next().is_none()
}

/// Moves a swap file left behind by an interrupted check back into place.
/// Returns `None` when there was nothing to repair.
fn repair_interrupted(path: &Path, name: &str) -> Option<bool> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let entries = std::fs::read_dir(parent).ok()?;
    let leftover = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .map_or(false, |n| is_swap_name(&n.to_string_lossy(), name))
        })?;
    if path.exists() {
        return None;
    }
    match std::fs::rename(&leftover, path) {
        Ok(()) => {
            warn!(path = %path.display(), from = %leftover.display(), "repaired interrupted release check");
            Some(true)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not repair interrupted release check");
            Some(false)
        }
    }
}

/// True when `path` can be renamed away and back. A path that does not exist
/// holds no handles and counts as accessible.
pub fn is_accessible(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return !path.exists();
    };
    if !path.exists() {
        return repair_interrupted(path, &name).unwrap_or(true);
    }
    let swap = swap_path(path, &name);
    if swap.exists() {
        debug!(path = %swap.display(), "swap name taken, treating file as held");
        return false;
    }
    match std::fs::rename(path, &swap) {
        Ok(()) => match std::fs::rename(&swap, path) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "release check could not restore file");
                false
            }
        },
        Err(err) => {
            debug!(path = %path.display(), error = %err, "file still held");
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseReport {
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Polls `check` until the file is free, yielding between attempts. Fails with
/// `ReleaseTimeout` once every retry in `policy` is spent.
pub async fn wait_for_release(
    path: &Path,
    policy: &ReleasePolicy,
    check: &dyn ReleaseCheck,
) -> Result<ReleaseReport> {
    let mut observed = Vec::new();
    let mut attempts = 1;
    if check.is_accessible(path) {
        return Ok(ReleaseReport {
            attempts,
            delays: observed,
        });
    }
    for delay in policy.delays() {
        tokio::time::sleep(delay).await;
        observed.push(delay);
        attempts += 1;
        if check.is_accessible(path) {
            debug!(path = %path.display(), attempts, "file released");
            return Ok(ReleaseReport {
                attempts,
                delays: observed,
            });
        }
    }
    warn!(path = %path.display(), attempts, "file never released");
    Err(DlcError::ReleaseTimeout {
        path: path.to_path_buf(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::Arc;

    struct HeldFile {
        released: Arc<AtomicBool>,
        checks: AtomicU32,
    }

    impl ReleaseCheck for HeldFile {
        fn is_accessible(&self, _path: &Path) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.released.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let delays: Vec<u64> = ReleasePolicy::default()
            .delays()
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(
            delays,
            vec![200, 400, 800, 1600, 2000, 2000, 2000, 2000, 2000, 2000]
        );
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn rename_check_leaves_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(&file, b"payload").unwrap();
        assert!(is_accessible(&file));
        assert_eq!(std::fs::read(&file).unwrap(), b"payload");
        assert_eq!(names(dir.path()), vec!["app.bin"]);
        assert!(is_accessible(&dir.path().join("missing.bin")));
    }

    #[test]
    fn interrupted_check_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(dir.path().join(".app.bin.4242.7.dlcswap"), b"payload").unwrap();
        assert!(is_accessible(&file));
        assert_eq!(std::fs::read(&file).unwrap(), b"payload");
        assert_eq!(names(dir.path()), vec!["app.bin"]);
    }

    #[test]
    fn unrelated_tmp_file_survives_next_to_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(&file, b"payload").unwrap();
        std::fs::write(dir.path().join("app.bin.tmp"), b"user data").unwrap();
        assert!(is_accessible(&file));
        assert_eq!(std::fs::read(&file).unwrap(), b"payload");
        assert_eq!(std::fs::read(dir.path().join("app.bin.tmp")).unwrap(), b"user data");
    }

    #[test]
    fn unrelated_files_are_not_claimed_for_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.bin");
        std::fs::write(dir.path().join("app.bin.tmp"), b"user data").unwrap();
        std::fs::write(dir.path().join(".app.bin.notes.dlcswap"), b"notes").unwrap();
        std::fs::write(dir.path().join(".app.bin.old.1.2.dlcswap"), b"other").unwrap();
        assert!(is_accessible(&file));
        assert!(!file.exists());
        assert_eq!(
            names(dir.path()),
            vec![".app.bin.notes.dlcswap", ".app.bin.old.1.2.dlcswap", "app.bin.tmp"]
        );
    }

    #[test]
    fn swap_names_are_unique_and_recognised() {
        let path = Path::new("/opt/app/app.bin");
        let a = swap_path(path, "app.bin");
        let b = swap_path(path, "app.bin");
        assert_ne!(a, b);
        for p in [&a, &b] {
            let n = p.file_name().unwrap().to_str().unwrap();
            assert!(is_swap_name(n, "app.bin"), "{n}");
            assert!(!is_swap_name(n, "app"));
        }
        assert!(!is_swap_name("app.bin.tmp", "app.bin"));
        assert!(!is_swap_name(".app.bin..1.dlcswap", "app.bin"));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_holder_releases() {
        let released = Arc::new(AtomicBool::new(false));
        let check = HeldFile {
            released: released.clone(),
            checks: AtomicU32::new(0),
        };
        let flag = released.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let report = wait_for_release(Path::new("held"), &ReleasePolicy::default(), &check)
            .await
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
        // 200 + 400 + 800 crosses the 1s mark.
        assert_eq!(report.attempts, 4);
        assert_eq!(check.checks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_capped_non_decreasing_delays() {
        let check = HeldFile {
            released: Arc::new(AtomicBool::new(false)),
            checks: AtomicU32::new(0),
        };
        let policy = ReleasePolicy {
            max_retries: 6,
            initial_delay_ms: 100,
            max_delay_ms: 500,
        };
        let err = wait_for_release(Path::new("held"), &policy, &check)
            .await
            .unwrap_err();
        match err {
            DlcError::ReleaseTimeout { attempts, .. } => assert_eq!(attempts, 7),
            other => panic!("unexpected error: {other}"),
        }
        let delays = policy.delays();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(500)));
    }
}
