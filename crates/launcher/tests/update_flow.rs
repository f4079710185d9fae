// Self-update flow against a loopback swarm: check, download, verify, stage,
// hand off, then run the helper in-process and relaunch at the new version.

mod common;

use common::{entry, hash, magnet, sha256_hex, zip_bytes, App, Events, Recorder, HELPER_PID};
use dlc_launcher::engine::LoopbackFile;
use dlc_launcher::release::RenameCheck;
use dlc_launcher::update::helper::run_helper;
use dlc_launcher::update::marker::{self, PendingMarker};
use dlc_launcher::update::{UpdateOutcome, UpdateStage};
use dlc_launcher::DlcError;
use dlc_protocol::{ContentId, ProgressEvent, StatusKind, UpdateReport, VersionInfo};
use std::path::Path;

fn release_package() -> Vec<u8> {
    zip_bytes(&[
        ("app/dlc-launcher", "v2"),
        ("app/lib/core.txt", "new core"),
        ("app/lib/extra.txt", "extra"),
    ])
}

/// APP listed at 1.0.0 and 1.2.0; 1.2.0 is published in the swarm when
/// `package` is given.
fn app_with_release(package: Option<&[u8]>) -> App {
    let mut newer = VersionInfo::new(magnet('2'));
    if let Some(bytes) = package {
        newer.sha256 = Some(sha256_hex(bytes));
    }
    let app = App::new(vec![
        entry(
            ContentId::App,
            &[("1.0.0", VersionInfo::new(magnet('1'))), ("1.2.0", newer)],
        ),
        entry(ContentId::TrainingTar, &[("1.0.0", VersionInfo::new(magnet('a')))]),
    ]);
    if let Some(bytes) = package {
        app.engine.publish(
            hash('2'),
            "app-1.2.0",
            vec![LoopbackFile::new("app-1.2.0.zip", bytes.to_vec())],
        );
    }
    app
}

#[tokio::test]
async fn update_is_applied_and_app_relaunches_at_new_version() {
    let package = release_package();
    let mut app = app_with_release(Some(&package));
    let (orchestrator, recorder) = app.orchestrator("1.0.0");

    let check = orchestrator.check_update().expect("check should succeed");
    assert!(check.have_new);
    assert_eq!(check.latest_version, "1.2.0");

    let events = Events::default();
    let sink = |e: ProgressEvent| events.push(e);
    let outcome = orchestrator
        .run(|c| c.latest_version == "1.2.0", &sink)
        .await
        .expect("update should hand off");
    let UpdateOutcome::HandedOff(handoff) = outcome else {
        panic!("expected hand-off, got {outcome:?}");
    };

    assert_eq!(handoff.version, "1.2.0");
    assert_eq!(handoff.helper_pid, HELPER_PID);
    assert_eq!(orchestrator.stage(), UpdateStage::Relaunching);
    assert!(handoff.script.is_file(), "helper script must be written");
    let spawned = recorder.calls();
    assert_eq!(spawned.len(), 1);
    assert!(spawned[0].1.iter().any(|a| Path::new(a) == handoff.script));
    assert!(PendingMarker::path(&app.paths.scratch_dir).is_file());
    assert_eq!(
        std::fs::read_to_string(app.paths.staged_dir.join("dlc-launcher")).unwrap(),
        "v2"
    );
    // Nothing in the install is touched before the helper runs.
    assert_eq!(app.read("dlc-launcher"), "v1");

    let all = events.all();
    assert!(all.iter().any(|e| e.status == StatusKind::Downloading));
    assert_eq!(
        events.messages().last().map(String::as_str),
        Some("restarting to apply update")
    );

    let mut args = handoff.args.clone();
    assert_eq!(args.parent_pid, Some(std::process::id()));
    args.parent_pid = None;
    let relauncher = Recorder::default();
    let report = run_helper(&args, &relauncher, &RenameCheck).await;
    assert!(
        matches!(&report, UpdateReport::Applied { version, .. } if version == "1.2.0"),
        "unexpected report {report:?}"
    );

    assert_eq!(app.read("dlc-launcher"), "v2");
    assert_eq!(app.read("lib/core.txt"), "new core");
    assert_eq!(app.read("lib/extra.txt"), "extra");
    assert_eq!(app.read("data/user.txt"), "keep me");
    assert!(app
        .registry
        .transfer_dir(ContentId::App, "1.2.0")
        .join("app-1.2.0.zip")
        .is_file());
    assert!(!PendingMarker::path(&app.paths.scratch_dir).exists());
    assert!(!app.paths.staged_dir.exists());
    assert!(!app.paths.backup_dir.exists());
    assert_eq!(
        relauncher.calls()[0].0,
        app.paths.app_dir.join("dlc-launcher")
    );

    // Next launch sees the report exactly once.
    let taken = marker::take_report(&app.paths.state_dir).expect("report left behind");
    assert_eq!(taken, report);
    assert!(marker::take_report(&app.paths.state_dir).is_none());

    app.restart();
    let (relaunched, _) = app.orchestrator("1.2.0");
    assert!(!relaunched.check_update().unwrap().have_new);
    let outcome = relaunched.run(|_| true, &|_: ProgressEvent| {}).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::NoUpdate(_)));
}

#[tokio::test]
async fn already_latest_is_a_noop() {
    let app = App::new(vec![entry(
        ContentId::App,
        &[
            ("0.9.0", VersionInfo::new(magnet('9'))),
            ("1.0.0", VersionInfo::new(magnet('1'))),
        ],
    )]);
    let (orchestrator, recorder) = app.orchestrator("1.0.0");
    let events = Events::default();
    let sink = |e: ProgressEvent| events.push(e);

    let outcome = orchestrator
        .run(|_| panic!("must not ask for confirmation"), &sink)
        .await
        .unwrap();

    assert!(matches!(outcome, UpdateOutcome::NoUpdate(ref c) if !c.have_new && c.latest_version == "1.0.0"));
    assert_eq!(events.messages(), vec!["no update available".to_string()]);
    assert_eq!(app.engine.add_count(), 0);
    assert!(recorder.calls().is_empty());
    assert!(!app.paths.update_log.exists());
    assert!(!app.paths.scratch_dir.exists());
    assert_eq!(orchestrator.stage(), UpdateStage::Idle);
}

#[tokio::test]
async fn unlisted_self_update_reports_no_update() {
    let app = App::new(vec![entry(
        ContentId::PdfTar,
        &[("1.0.0", VersionInfo::new(magnet('c')))],
    )]);
    let (orchestrator, _) = app.orchestrator("1.0.0");
    let check = orchestrator.check_update().expect("unlisted app is not an error");
    assert!(!check.have_new);
    assert_eq!(check.latest_version, "1.0.0");
    let outcome = orchestrator.run(|_| true, &|_: ProgressEvent| {}).await.unwrap();
    assert!(matches!(outcome, UpdateOutcome::NoUpdate(ref c) if *c == check));
}

#[tokio::test]
async fn declined_update_downloads_nothing() {
    let package = release_package();
    let app = app_with_release(Some(&package));
    let (orchestrator, recorder) = app.orchestrator("1.0.0");
    let events = Events::default();
    let sink = |e: ProgressEvent| events.push(e);

    let outcome = orchestrator.run(|_| false, &sink).await.unwrap();

    assert!(matches!(outcome, UpdateOutcome::Declined(ref c) if c.latest_version == "1.2.0"));
    assert_eq!(events.messages(), vec!["update declined".to_string()]);
    assert_eq!(app.engine.add_count(), 0);
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn malformed_versions_are_rejected() {
    let app = app_with_release(None);
    let (orchestrator, _) = app.orchestrator("not-a-version");
    let events = Events::default();
    let sink = |e: ProgressEvent| events.push(e);
    let err = orchestrator.run(|_| true, &sink).await.unwrap_err();
    assert!(matches!(err, DlcError::InvalidVersion { ref version, .. } if version == "not-a-version"));
    assert!(events.messages()[0].starts_with("update failed:"));
    assert_eq!(orchestrator.stage(), UpdateStage::Failed);

    let broken_index = App::new(vec![entry(
        ContentId::App,
        &[
            ("1.0.0", VersionInfo::new(magnet('1'))),
            ("1.x", VersionInfo::new(magnet('2'))),
        ],
    )]);
    let (orchestrator, _) = broken_index.orchestrator("1.0.0");
    let err = orchestrator.check_update().unwrap_err();
    assert!(matches!(err, DlcError::InvalidVersion { ref version, .. } if version == "1.x"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_run_is_busy_and_stalled_download_times_out() {
    let app = app_with_release(None);
    let (orchestrator, recorder) = app.orchestrator("1.0.0");
    let events = Events::default();
    let sink = |e: ProgressEvent| events.push(e);

    let first = orchestrator.run(|_| true, &sink);
    let second = async {
        while !orchestrator.is_busy() {
            tokio::task::yield_now().await;
        }
        orchestrator.run(|_| true, &sink).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(matches!(second.unwrap(), UpdateOutcome::Busy));
    let err = first.unwrap_err();
    assert!(
        matches!(err, DlcError::DownloadTimeout { percent: 0, downloaded_bytes: 0, .. }),
        "unexpected error {err:?}"
    );
    assert!(!orchestrator.is_busy());
    assert_eq!(orchestrator.stage(), UpdateStage::Failed);
    assert!(recorder.calls().is_empty());
    assert!(events
        .messages()
        .last()
        .map_or(false, |m| m.starts_with("update failed:")));

    let log = std::fs::read_to_string(&app.paths.update_log).unwrap();
    assert!(log.contains("[ERROR] update failed"));
    assert!(log.contains("\"stage\":\"downloading\""));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_download_pauses_the_transfer() {
    let app = app_with_release(None);
    let (orchestrator, _) = app.orchestrator("1.0.0");

    let run = orchestrator.run(|_| true, &|_: ProgressEvent| {});
    let cancel = async {
        while orchestrator.stage() != UpdateStage::Downloading {
            tokio::task::yield_now().await;
        }
        orchestrator.cancel();
    };
    let (result, ()) = tokio::join!(run, cancel);

    assert!(matches!(result, Err(DlcError::Cancelled)));
    let snap = app.registry.snapshot(&magnet('2')).expect("transfer still registered");
    assert!(snap.paused);
    assert!(!PendingMarker::path(&app.paths.scratch_dir).exists());
}

#[tokio::test]
async fn package_without_main_executable_fails_verification() {
    let package = zip_bytes(&[("app/readme.txt", "no binary here")]);
    let app = app_with_release(Some(&package));
    let (orchestrator, recorder) = app.orchestrator("1.0.0");

    let err = orchestrator.run(|_| true, &|_: ProgressEvent| {}).await.unwrap_err();

    assert!(matches!(err, DlcError::VerificationFailed(_)), "unexpected error {err:?}");
    assert!(recorder.calls().is_empty());
    assert!(!app.paths.staged_dir.exists());
    assert!(!PendingMarker::path(&app.paths.scratch_dir).exists());
    assert!(!app.registry.contains(&hash('2')).await);
    assert_eq!(app.read("dlc-launcher"), "v1");
}

#[tokio::test]
async fn digest_mismatch_fails_verification() {
    let package = release_package();
    let app = app_with_release(Some(&package));
    // Republish different bytes under the same hash.
    app.engine.publish(
        hash('2'),
        "app-1.2.0",
        vec![LoopbackFile::new("app-1.2.0.zip", zip_bytes(&[("app/dlc-launcher", "evil")]))],
    );
    let (orchestrator, _) = app.orchestrator("1.0.0");
    let err = orchestrator.run(|_| true, &|_: ProgressEvent| {}).await.unwrap_err();
    assert!(matches!(err, DlcError::VerificationFailed(ref m) if m.contains("sha256")));
}
