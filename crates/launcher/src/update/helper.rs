//! The detached half of an update.
//!
//! The running launcher copies its own binary into the scratch directory,
//! writes a small shell/batch script around `apply-update`, starts the script
//! outside its own process group and exits. The script's process waits for
//! the parent to disappear, applies the staged files with rollback, records
//! the outcome and starts the application again.

use crate::error::{DlcError, IoContext, Result};
use crate::release::{ReleaseCheck, ReleasePolicy};
use crate::update::install::{apply_staged, InstallLayout};
use crate::update::log::UpdateLog;
use crate::update::marker::{self, PendingMarker};
use crate::update::UpdateStage;
use clap::Args;
use dlc_protocol::UpdateReport;
use serde_json::json;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// Arguments of the hidden `apply-update` subcommand.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ApplyUpdateArgs {
    #[arg(long)]
    pub parent_pid: Option<u32>,

    #[arg(long)]
    pub app_dir: PathBuf,

    #[arg(long)]
    pub staged_dir: PathBuf,

    #[arg(long)]
    pub backup_dir: PathBuf,

    #[arg(long)]
    pub scratch_dir: PathBuf,

    #[arg(long)]
    pub state_dir: PathBuf,

    /// Executable to start afterwards, relative to `app_dir`.
    #[arg(long)]
    pub relaunch: PathBuf,

    #[arg(long)]
    pub log_file: PathBuf,

    #[arg(long)]
    pub target_version: String,

    #[arg(long = "preserve")]
    pub preserve: Vec<PathBuf>,

    #[arg(long, default_value_t = 30)]
    pub parent_timeout_secs: u64,

    #[arg(long, default_value_t = 10)]
    pub max_retries: u32,

    #[arg(long, default_value_t = 200)]
    pub initial_delay_ms: u64,

    #[arg(long, default_value_t = 2000)]
    pub max_delay_ms: u64,
}

impl ApplyUpdateArgs {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut out: Vec<OsString> = vec!["apply-update".into()];
        let mut push = |flag: &str, value: OsString| {
            out.push(flag.into());
            out.push(value);
        };
        if let Some(pid) = self.parent_pid {
            push("--parent-pid", pid.to_string().into());
        }
        push("--app-dir", self.app_dir.clone().into_os_string());
        push("--staged-dir", self.staged_dir.clone().into_os_string());
        push("--backup-dir", self.backup_dir.clone().into_os_string());
        push("--scratch-dir", self.scratch_dir.clone().into_os_string());
        push("--state-dir", self.state_dir.clone().into_os_string());
        push("--relaunch", self.relaunch.clone().into_os_string());
        push("--log-file", self.log_file.clone().into_os_string());
        push("--target-version", self.target_version.clone().into());
        for p in &self.preserve {
            push("--preserve", p.clone().into_os_string());
        }
        push("--parent-timeout-secs", self.parent_timeout_secs.to_string().into());
        push("--max-retries", self.max_retries.to_string().into());
        push("--initial-delay-ms", self.initial_delay_ms.to_string().into());
        push("--max-delay-ms", self.max_delay_ms.to_string().into());
        out
    }

    pub fn layout(&self) -> InstallLayout {
        InstallLayout {
            app_dir: self.app_dir.clone(),
            staged_dir: self.staged_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            preserve: self.preserve.clone(),
        }
    }

    pub fn release_policy(&self) -> ReleasePolicy {
        ReleasePolicy {
            max_retries: self.max_retries,
            initial_delay_ms: self.initial_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[cfg(unix)]
fn quote(arg: &std::ffi::OsStr) -> String {
    format!("'{}'", arg.to_string_lossy().replace('\'', r"'\''"))
}

#[cfg(windows)]
fn quote(arg: &std::ffi::OsStr) -> String {
    format!("\"{}\"", arg.to_string_lossy().replace('"', "").replace('%', "%%"))
}

#[cfg(unix)]
fn render_script(helper: &Path, args: &ApplyUpdateArgs) -> String {
    let command = std::iter::once(quote(helper.as_os_str()))
        .chain(args.to_args().iter().map(|a| quote(a)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        r#"#!/bin/sh
LOG={log}
stamp() {{ date -u +%Y-%m-%dT%H:%M:%SZ; }}
echo "[$(stamp)] [SCRIPT] update helper starting for {version}" >> "$LOG"
{command}
STATUS=$?
if [ "$STATUS" -eq 0 ]; then
  echo "[$(stamp)] [SCRIPT] helper finished, removing $0" >> "$LOG"
  rm -f "$0"
else
  echo "[$(stamp)] [SCRIPT] helper exited with status $STATUS, keeping $0 for diagnosis" >> "$LOG"
fi
exit $STATUS
"#,
        log = quote(args.log_file.as_os_str()),
        version = args.target_version.replace(['"', '$', '`', '\\'], ""),
    )
}

#[cfg(windows)]
fn render_script(helper: &Path, args: &ApplyUpdateArgs) -> String {
    let command = std::iter::once(quote(helper.as_os_str()))
        .chain(args.to_args().iter().map(|a| quote(a)))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "@echo off\r\n\
setlocal\r\n\
set \"LOG={log}\"\r\n\
echo [%date% %time%] [SCRIPT] update helper starting for {version}>>\"%LOG%\"\r\n\
{command}\r\n\
set STATUS=%ERRORLEVEL%\r\n\
if \"%STATUS%\"==\"0\" goto cleanup\r\n\
echo [%date% %time%] [SCRIPT] helper exited with status %STATUS%, keeping %~f0 for diagnosis>>\"%LOG%\"\r\n\
exit /b %STATUS%\r\n\
:cleanup\r\n\
echo [%date% %time%] [SCRIPT] helper finished, removing %~f0>>\"%LOG%\"\r\n\
(goto) 2>nul & del \"%~f0\"\r\n",
        log = args.log_file.to_string_lossy().replace('"', "").replace('%', "%%"),
        version = args.target_version.replace(['"', '%', '&', '|', '<', '>', '^'], ""),
    )
}

pub fn script_path(scratch_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        scratch_dir.join("apply-update.cmd")
    } else {
        scratch_dir.join("apply-update.sh")
    }
}

/// Writes the script that runs `helper apply-update ...` and cleans up after
/// itself.
pub fn write_helper_script(scratch_dir: &Path, helper: &Path, args: &ApplyUpdateArgs) -> Result<PathBuf> {
    std::fs::create_dir_all(scratch_dir).at(scratch_dir)?;
    let path = script_path(scratch_dir);
    std::fs::write(&path, render_script(helper, args)).at(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).at(&path)?;
    }
    info!(script = %path.display(), "update helper script written");
    Ok(path)
}

pub fn script_command(script: &Path) -> (PathBuf, Vec<OsString>) {
    if cfg!(windows) {
        (
            PathBuf::from("cmd.exe"),
            vec!["/C".into(), script.as_os_str().to_os_string()],
        )
    } else {
        (PathBuf::from("/bin/sh"), vec![script.as_os_str().to_os_string()])
    }
}

/// Copies the running binary next to the staged files so the installed copy
/// can be replaced while the helper runs.
pub fn prepare_helper_binary(source: &Path, scratch_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(scratch_dir).at(scratch_dir)?;
    let name = format!("dlc-update-helper{}", std::env::consts::EXE_SUFFIX);
    let target = scratch_dir.join(name);
    if target.exists() {
        std::fs::remove_file(&target).at(&target)?;
    }
    std::fs::copy(source, &target).at(source)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).at(&target)?;
    }
    Ok(target)
}

/// Process-launch primitive. Spawned processes must not share the caller's
/// lifetime or process group.
pub trait ProcessLauncher: Send + Sync {
    fn spawn_detached(&self, program: &Path, args: &[OsString], cwd: &Path) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedLauncher;

impl ProcessLauncher for DetachedLauncher {
    fn spawn_detached(&self, program: &Path, args: &[OsString], cwd: &Path) -> Result<u32> {
        spawn_detached(program, args, cwd)
    }
}

#[cfg(windows)]
const DETACHED_PROCESS: u32 = 0x0000_0008;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_BREAKAWAY_FROM_JOB: u32 = 0x0100_0000;

fn base_command(program: &Path, args: &[OsString], cwd: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Starts `program` fully detached and returns its pid without waiting.
pub fn spawn_detached(program: &Path, args: &[OsString], cwd: &Path) -> Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        let child = base_command(program, args, cwd)
            .process_group(0)
            .spawn()
            .at(program)?;
        info!(program = %program.display(), pid = child.id(), "detached process started");
        Ok(child.id())
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        let child = match base_command(program, args, cwd)
            .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_BREAKAWAY_FROM_JOB)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                // Jobs without JOB_OBJECT_LIMIT_BREAKAWAY_OK refuse the breakaway flag.
                warn!(error = %err, "breakaway spawn refused, retrying without it");
                base_command(program, args, cwd)
                    .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)
                    .spawn()
                    .at(program)?
            }
        };
        info!(program = %program.display(), pid = child.id(), "detached process started");
        Ok(child.id())
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(unix)]
async fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)
        .map_err(|e| DlcError::io(format!("pid {pid}"), std::io::Error::from(e)))
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stdin(Stdio::null())
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(windows)]
async fn force_kill(pid: u32) -> Result<()> {
    let status = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F"])
        .status()
        .await
        .at("taskkill")?;
    if status.success() {
        Ok(())
    } else {
        Err(DlcError::Engine(format!("taskkill {pid} exited with {status}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentExit {
    Exited,
    Killed,
}

pub async fn wait_for_parent_exit(pid: u32, timeout: Duration) -> Result<ParentExit> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(ParentExit::Exited);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    if !process_alive(pid) {
        return Ok(ParentExit::Exited);
    }
    warn!(pid, ?timeout, "parent did not exit, terminating it");
    force_kill(pid).await?;
    for _ in 0..20 {
        if !process_alive(pid) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(ParentExit::Killed)
}

/// Body of `apply-update`. Always leaves a report behind and tries to start
/// whichever executable is installed afterwards.
pub async fn run_helper(
    args: &ApplyUpdateArgs,
    launcher: &dyn ProcessLauncher,
    check: &dyn ReleaseCheck,
) -> UpdateReport {
    let log = UpdateLog::open(&args.log_file);
    log.info(
        "helper started",
        json!({
            "target_version": args.target_version,
            "app_dir": args.app_dir,
            "parent_pid": args.parent_pid,
        }),
    );

    if let Some(pid) = args.parent_pid {
        match wait_for_parent_exit(pid, Duration::from_secs(args.parent_timeout_secs)).await {
            Ok(ParentExit::Exited) => log.info("parent exited", json!({ "pid": pid })),
            Ok(ParentExit::Killed) => log.warn("parent hung and was terminated", json!({ "pid": pid })),
            Err(err) => log.warn("could not terminate parent", json!({ "pid": pid, "error": err.to_string() })),
        }
    }

    let layout = args.layout();
    let finished_at = || chrono::Utc::now().to_rfc3339();
    let report = match apply_staged(&layout, &args.release_policy(), check, &log).await {
        Ok(applied) => {
            log.info(
                "update applied",
                json!({ "version": args.target_version, "files": applied.replaced.len() }),
            );
            UpdateReport::Applied {
                version: args.target_version.clone(),
                finished_at: finished_at(),
            }
        }
        Err(DlcError::ReplacementFailed { reason, restored }) => UpdateReport::Failed {
            version: args.target_version.clone(),
            reason,
            restored,
            finished_at: finished_at(),
        },
        Err(err) => UpdateReport::Failed {
            version: args.target_version.clone(),
            reason: err.to_string(),
            restored: false,
            finished_at: finished_at(),
        },
    };

    if let Err(err) = marker::write_report(&args.state_dir, &report) {
        log.error("could not write update report", json!({ "error": err.to_string() }));
    }
    PendingMarker::clear(&args.scratch_dir);

    let exe = args.app_dir.join(&args.relaunch);
    log.info("relaunching application", json!({ "stage": UpdateStage::Relaunching, "exe": exe }));
    match launcher.spawn_detached(&exe, &[], &args.app_dir) {
        Ok(pid) => log.info("application relaunched", json!({ "exe": exe, "pid": pid })),
        Err(err) => log.error("relaunch failed", json!({ "exe": exe, "error": err.to_string() })),
    }

    let mut leftovers = vec![&args.staged_dir];
    if matches!(report, UpdateReport::Applied { .. } | UpdateReport::Failed { restored: true, .. }) {
        leftovers.push(&args.backup_dir);
    }
    for dir in leftovers {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log.warn("cleanup failed", json!({ "path": dir, "error": err.to_string() }));
            }
        }
    }

    match &report {
        UpdateReport::Applied { .. } => {
            log.info("helper finished", json!({ "stage": UpdateStage::Done, "report": report }))
        }
        UpdateReport::Failed { .. } => {
            log.error("helper finished", json!({ "stage": UpdateStage::Failed, "report": report }))
        }
    }
    report
}
