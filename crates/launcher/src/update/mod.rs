//! Self-update state machine.
//!
//! `Idle -> Checking -> AwaitingConfirmation -> Downloading -> Verifying ->
//! Staging -> Relaunching`, with `Failed` reachable from every stage. The
//! destructive half (Backing-up, Replacing) runs in the detached helper after
//! this process exits; see [`helper`].

pub mod helper;
pub mod install;
pub mod log;
pub mod marker;
pub mod verify;

use crate::error::{DlcError, Result};
use crate::registry::TransferRegistry;
use crate::release::{wait_for_release, ReleaseCheck, ReleasePolicy, RenameCheck};
use crate::service::RuntimeService;
use dlc_protocol::{ContentId, ProgressEvent, UpdateCheck, VersionInfo};
use self::helper::{ApplyUpdateArgs, ProcessLauncher};
use self::log::UpdateLog;
use self::marker::PendingMarker;
use self::verify::PackageSpec;
use semver::Version;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStage {
    Idle,
    Checking,
    AwaitingConfirmation,
    Downloading,
    Verifying,
    Staging,
    BackingUp,
    Replacing,
    Relaunching,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    pub target_version: String,
    pub package_path: Option<PathBuf>,
    pub stage: UpdateStage,
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub self_id: ContentId,
    pub current_version: String,
    pub app_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub staged_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub state_dir: PathBuf,
    pub update_log: PathBuf,
    pub helper_log: PathBuf,
    /// Relative to `app_dir` and to the package root.
    pub main_executable: PathBuf,
    pub package_suffix: String,
    pub required_entries: Vec<PathBuf>,
    pub preserve: Vec<PathBuf>,
    pub download_ceiling: Duration,
    pub destroy_timeout: Duration,
    pub parent_exit_timeout: Duration,
    pub release: ReleasePolicy,
    /// Binary copied into the scratch directory to run `apply-update`.
    pub helper_source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpdate {
    pub version: String,
    pub package: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandOff {
    pub version: String,
    pub script: PathBuf,
    pub helper_pid: u32,
    pub args: ApplyUpdateArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    NoUpdate(UpdateCheck),
    Declined(UpdateCheck),
    Busy,
    HandedOff(HandOff),
}

pub type ProgressSink<'a> = &'a (dyn Fn(ProgressEvent) + Send + Sync);

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct UpdateOrchestrator {
    registry: Arc<TransferRegistry>,
    settings: UpdateSettings,
    launcher: Arc<dyn ProcessLauncher>,
    release_check: Arc<dyn ReleaseCheck>,
    service: Option<Arc<dyn RuntimeService>>,
    log: UpdateLog,
    busy: AtomicBool,
    cancel: watch::Sender<bool>,
    stage: Mutex<UpdateStage>,
}

impl UpdateOrchestrator {
    pub fn new(
        registry: Arc<TransferRegistry>,
        settings: UpdateSettings,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let log = UpdateLog::open(&settings.update_log);
        let (cancel, _) = watch::channel(false);
        Self {
            registry,
            settings,
            launcher,
            release_check: Arc::new(RenameCheck),
            service: None,
            log,
            busy: AtomicBool::new(false),
            cancel,
            stage: Mutex::new(UpdateStage::Idle),
        }
    }

    pub fn with_service(mut self, service: Arc<dyn RuntimeService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn with_release_check(mut self, release_check: Arc<dyn ReleaseCheck>) -> Self {
        self.release_check = release_check;
        self
    }

    pub fn settings(&self) -> &UpdateSettings {
        &self.settings
    }

    pub fn stage(&self) -> UpdateStage {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Requests cancellation. Honoured while checking, downloading or
    /// verifying; ignored once the hand-off has started.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn set_stage(&self, stage: UpdateStage) {
        *self.stage.lock().unwrap_or_else(|p| p.into_inner()) = stage;
    }

    fn advance(&self, session: &mut UpdateSession, stage: UpdateStage) {
        self.set_stage(stage);
        session.stage = stage;
        self.log.info(
            "stage",
            json!({ "stage": stage, "target_version": session.target_version }),
        );
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if *self.cancel.borrow() {
            Err(DlcError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Compares the running version with the newest self-update in the index.
    /// An index that does not list the application at all means no update.
    pub fn check_update(&self) -> Result<UpdateCheck> {
        let current = Version::parse(&self.settings.current_version)
            .map_err(|e| DlcError::invalid_version(&self.settings.current_version, e))?;
        let latest = match self.registry.index().latest_version(self.settings.self_id) {
            Ok((latest, _)) => latest,
            Err(DlcError::NotFound(what)) => {
                info!(%what, "self-update not listed in the content index");
                return Ok(UpdateCheck {
                    current_version: self.settings.current_version.clone(),
                    latest_version: self.settings.current_version.clone(),
                    have_new: false,
                });
            }
            Err(err) => return Err(err),
        };
        let latest_parsed =
            Version::parse(&latest).map_err(|e| DlcError::invalid_version(&latest, e))?;
        Ok(UpdateCheck {
            current_version: self.settings.current_version.clone(),
            latest_version: latest,
            have_new: current < latest_parsed,
        })
    }

    /// Fetches `version` over the transfer registry and returns the directory
    /// holding the payload.
    pub async fn download_update(
        &self,
        version: &str,
        info: &VersionInfo,
        sink: ProgressSink<'_>,
    ) -> Result<PathBuf> {
        self.ensure_not_cancelled()?;
        let started = self.registry.start(info).await?;
        let dir = self.registry.transfer_dir(self.settings.self_id, version);
        sink(ProgressEvent::downloading(started.percent(), started.download_speed));

        let mut cancelled = self.cancel.subscribe();
        let wait = self.registry.wait_until_done(
            &started.info_hash,
            self.settings.download_ceiling,
            |snap| sink(ProgressEvent::downloading(snap.percent(), snap.download_speed)),
        );
        tokio::select! {
            done = wait => {
                let done = done?;
                info!(info_hash = %done.info_hash, bytes = done.total_bytes, "update payload downloaded");
            }
            _ = async { let _ = cancelled.wait_for(|c| *c).await; } => {
                warn!(version, "update download cancelled");
                self.registry.pause(started.info_hash.as_str()).await?;
                return Err(DlcError::Cancelled);
            }
        }
        Ok(dir)
    }

    /// Releases the downloaded package, verifies it and extracts it into the
    /// staging directory.
    pub async fn prepare_install(
        &self,
        version: &str,
        info: &VersionInfo,
        download_dir: &std::path::Path,
    ) -> Result<StagedUpdate> {
        self.ensure_not_cancelled()?;
        self.registry
            .destroy_for_install(&info.magnet, self.settings.destroy_timeout)
            .await?;

        let package = verify::find_package(download_dir, &self.settings.package_suffix)?;
        wait_for_release(&package, &self.settings.release, self.release_check.as_ref()).await?;

        let spec = PackageSpec {
            suffix: self.settings.package_suffix.clone(),
            main_executable: self.settings.main_executable.clone(),
            required_entries: self.settings.required_entries.clone(),
            sha256: info.sha256.clone(),
        };
        let verified = verify::verify_package(download_dir, &spec)?;
        self.ensure_not_cancelled()?;
        let files = verify::stage_package(&verified, &self.settings.staged_dir)?;
        self.log.info(
            "package staged",
            json!({ "package": verified.path, "files": files.len(), "staged": self.settings.staged_dir }),
        );
        Ok(StagedUpdate {
            version: version.to_string(),
            package: verified.path,
            files,
        })
    }

    pub fn helper_args(&self, version: &str) -> ApplyUpdateArgs {
        let s = &self.settings;
        ApplyUpdateArgs {
            parent_pid: Some(std::process::id()),
            app_dir: s.app_dir.clone(),
            staged_dir: s.staged_dir.clone(),
            backup_dir: s.backup_dir.clone(),
            scratch_dir: s.scratch_dir.clone(),
            state_dir: s.state_dir.clone(),
            relaunch: s.main_executable.clone(),
            log_file: s.helper_log.clone(),
            target_version: version.to_string(),
            preserve: s.preserve.clone(),
            parent_timeout_secs: s.parent_exit_timeout.as_secs(),
            max_retries: s.release.max_retries,
            initial_delay_ms: s.release.initial_delay_ms,
            max_delay_ms: s.release.max_delay_ms,
        }
    }

    /// Stops the dependent service, leaves a pending marker and starts the
    /// detached helper. The caller is expected to exit right after.
    pub async fn hand_off(&self, staged: &StagedUpdate) -> Result<HandOff> {
        if let Some(service) = &self.service {
            if let Err(err) = service.stop().await {
                warn!(service = service.name(), error = %err, "runtime service did not stop, continuing");
                self.log.warn(
                    "runtime service did not stop",
                    json!({ "service": service.name(), "error": err.to_string() }),
                );
            }
        }

        match self.spawn_helper(staged) {
            Ok(handoff) => {
                self.log.info(
                    "helper started",
                    json!({ "pid": handoff.helper_pid, "script": handoff.script }),
                );
                Ok(handoff)
            }
            Err(err) => {
                PendingMarker::clear(&self.settings.scratch_dir);
                if let Some(service) = &self.service {
                    if let Err(start_err) = service.start().await {
                        warn!(service = service.name(), error = %start_err, "runtime service restart failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn spawn_helper(&self, staged: &StagedUpdate) -> Result<HandOff> {
        let scratch = &self.settings.scratch_dir;
        PendingMarker::new(&staged.version).write(scratch)?;
        let helper_exe = helper::prepare_helper_binary(&self.settings.helper_source, scratch)?;
        let args = self.helper_args(&staged.version);
        let script = helper::write_helper_script(scratch, &helper_exe, &args)?;
        let (program, argv) = helper::script_command(&script);
        let helper_pid = self.launcher.spawn_detached(&program, &argv, scratch)?;
        Ok(HandOff {
            version: staged.version.clone(),
            script,
            helper_pid,
            args,
        })
    }

    /// Full flow. `confirm` is asked once an update is found; a second call
    /// while one is running returns `Busy` immediately.
    pub async fn run(
        &self,
        confirm: impl FnOnce(&UpdateCheck) -> bool,
        sink: ProgressSink<'_>,
    ) -> Result<UpdateOutcome> {
        let Some(_guard) = BusyGuard::acquire(&self.busy) else {
            info!("update already in progress");
            return Ok(UpdateOutcome::Busy);
        };
        self.cancel.send_replace(false);
        self.set_stage(UpdateStage::Checking);

        let check = match self.check_update() {
            Ok(check) => check,
            Err(err) => {
                self.set_stage(UpdateStage::Failed);
                warn!(error = %err, "update check failed");
                sink(ProgressEvent::idle(format!("update failed: {err}")));
                return Err(err);
            }
        };
        if !check.have_new {
            self.set_stage(UpdateStage::Idle);
            sink(ProgressEvent::idle("no update available"));
            return Ok(UpdateOutcome::NoUpdate(check));
        }

        self.set_stage(UpdateStage::AwaitingConfirmation);
        if !confirm(&check) {
            info!(latest = %check.latest_version, "update declined");
            self.set_stage(UpdateStage::Idle);
            sink(ProgressEvent::idle("update declined"));
            return Ok(UpdateOutcome::Declined(check));
        }

        let mut session = UpdateSession {
            target_version: check.latest_version.clone(),
            package_path: None,
            stage: UpdateStage::AwaitingConfirmation,
        };
        self.log.info(
            "update confirmed",
            json!({ "from": check.current_version, "to": check.latest_version }),
        );

        match self.attempt(&mut session, sink).await {
            Ok(handoff) => {
                sink(ProgressEvent::installing("restarting to apply update"));
                Ok(UpdateOutcome::HandedOff(handoff))
            }
            Err(err) => {
                let failed_in = session.stage;
                self.advance(&mut session, UpdateStage::Failed);
                self.log.error(
                    "update failed",
                    json!({ "stage": failed_in, "error": err.to_string(), "package": session.package_path }),
                );
                sink(ProgressEvent::idle(format!("update failed: {err}")));
                Err(err)
            }
        }
    }

    async fn attempt(&self, session: &mut UpdateSession, sink: ProgressSink<'_>) -> Result<HandOff> {
        let version = session.target_version.clone();
        let info = self.registry.index().version_info(self.settings.self_id, &version)?;

        self.advance(session, UpdateStage::Downloading);
        let download_dir = self.download_update(&version, &info, sink).await?;

        self.advance(session, UpdateStage::Verifying);
        sink(ProgressEvent::installing("verifying update package"));
        let staged = self.prepare_install(&version, &info, &download_dir).await?;
        session.package_path = Some(staged.package.clone());
        self.advance(session, UpdateStage::Staging);

        self.advance(session, UpdateStage::Relaunching);
        sink(ProgressEvent::installing("handing off to update helper"));
        self.hand_off(&staged).await
    }
}
