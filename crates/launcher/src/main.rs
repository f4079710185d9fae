use anyhow::Context;
use clap::{Parser, Subcommand};
use dlc_launcher::config::{default_config_path, LauncherConfig, LauncherPaths};
use dlc_launcher::engine::TransferEngine;
use dlc_launcher::persistence::{restore_all, RestoreReport};
use dlc_launcher::registry::TransferRegistry;
use dlc_launcher::release::RenameCheck;
use dlc_launcher::service::CommandService;
use dlc_launcher::update::helper::{run_helper, ApplyUpdateArgs, DetachedLauncher};
use dlc_launcher::update::marker::{self, PendingMarker};
use dlc_launcher::update::{UpdateOrchestrator, UpdateOutcome};
use dlc_protocol::{ContentId, ProgressEvent, UpdateCheck, UpdateReport};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dlc-launcher", version, about = "Peer-to-peer content launcher")]
struct Args {
    /// Installation directory. Defaults to the directory of this executable.
    #[arg(long, global = true)]
    app_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore transfers and keep them running until interrupted (default).
    Run,
    /// Show the content index with live progress.
    List,
    /// Download a content item and wait for it to finish.
    Fetch {
        id: ContentId,
        /// Defaults to the newest listed version.
        version: Option<String>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    /// Remove a transfer and delete its files.
    Remove {
        id: String,
    },
    /// Re-attach persisted transfers and print what happened.
    Restore,
    CheckUpdate,
    Update {
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    #[command(hide = true)]
    ApplyUpdate(ApplyUpdateArgs),
}

struct Launcher {
    config: LauncherConfig,
    paths: LauncherPaths,
    registry: Arc<TransferRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    if let Some(Command::ApplyUpdate(apply)) = &args.command {
        let report = run_helper(apply, &DetachedLauncher, &RenameCheck).await;
        info!(message = %report.user_message(), "update helper done");
        if matches!(report, UpdateReport::Failed { .. }) {
            std::process::exit(1);
        }
        return Ok(());
    }

    let launcher = build_launcher(&args).await?;
    let restored = startup(&launcher).await?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_foreground(&launcher).await,
        Command::List => list(&launcher).await,
        Command::Fetch { id, version } => fetch(&launcher, id, version).await,
        Command::Pause { id } => {
            launcher.registry.pause(&id).await?;
            print_json(&launcher.registry.snapshot(&id))
        }
        Command::Resume { id } => {
            launcher.registry.resume(&id).await?;
            print_json(&launcher.registry.snapshot(&id))
        }
        Command::Remove { id } => {
            launcher.registry.remove(&id).await?;
            println!("removed {id}");
            Ok(())
        }
        Command::Restore => {
            for t in &restored.restored {
                let state = if t.seeding { "seeding" } else { "paused" };
                println!("restored {} {} {} ({state})", t.content_id, t.version, t.info_hash);
            }
            for (path, reason) in &restored.rejected {
                println!("skipped {} ({reason:?})", path.display());
            }
            Ok(())
        }
        Command::CheckUpdate => {
            let orchestrator = orchestrator(&launcher)?;
            print_json(&orchestrator.check_update()?)
        }
        Command::Update { yes } => update(&launcher, yes).await,
        Command::ApplyUpdate(_) => Ok(()),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_app_dir(args: &Args) -> anyhow::Result<PathBuf> {
    if let Some(dir) = &args.app_dir {
        return Ok(dir.clone());
    }
    let exe = std::env::current_exe().context("failed to locate the running executable")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable has no parent directory")
}

async fn build_launcher(args: &Args) -> anyhow::Result<Launcher> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = match LauncherConfig::load(&config_path)
        .with_context(|| format!("failed to read launcher config {}", config_path.display()))?
    {
        Some(saved) => {
            info!(path = %config_path.display(), "loaded launcher config");
            saved
        }
        None => LauncherConfig::default(),
    };
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }

    let app_dir = resolve_app_dir(args)?;
    let paths = config.resolve(&app_dir);
    std::fs::create_dir_all(&paths.content_root)
        .with_context(|| format!("failed to create {}", paths.content_root.display()))?;

    let engine = build_engine(&config, &paths).await?;
    let registry = Arc::new(TransferRegistry::new(
        engine,
        paths.manifest_path.clone(),
        paths.content_root.clone(),
        config.poll_interval(),
    ));
    info!(app_dir = %paths.app_dir.display(), content_root = %paths.content_root.display(), "launcher configured");
    Ok(Launcher {
        config,
        paths,
        registry,
    })
}

#[cfg(feature = "rqbit")]
async fn build_engine(config: &LauncherConfig, paths: &LauncherPaths) -> anyhow::Result<Arc<dyn TransferEngine>> {
    let engine = dlc_launcher::engine::RqbitEngine::new(paths.content_root.clone(), config.transport.clone())
        .await
        .context("failed to start the torrent session")?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "rqbit"))]
async fn build_engine(config: &LauncherConfig, _paths: &LauncherPaths) -> anyhow::Result<Arc<dyn TransferEngine>> {
    warn!(
        trackers = config.transport.trackers.len(),
        "built without the `rqbit` feature, transfers use the offline loopback engine"
    );
    Ok(Arc::new(dlc_launcher::engine::LoopbackEngine::new()))
}

async fn startup(launcher: &Launcher) -> anyhow::Result<RestoreReport> {
    if let Some(stale) = PendingMarker::discard_stale(&launcher.paths.scratch_dir) {
        warn!(target_version = %stale.target_version, pid = stale.pid, "previous update attempt did not finish and was discarded");
    }
    if let Some(report) = marker::take_report(&launcher.paths.state_dir) {
        println!("{}", report.user_message());
    }
    let report = restore_all(&launcher.registry)
        .await
        .context("failed to restore persisted transfers")?;
    info!(restored = report.restored.len(), rejected = report.rejected.len(), "startup restore finished");
    Ok(report)
}

async fn run_foreground(launcher: &Launcher) -> anyhow::Result<()> {
    launcher.registry.spawn_progress_loop();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    let mut updates = launcher.registry.subscribe();
    let progress = async {
        while updates.changed().await.is_ok() {
            let snapshots = updates.borrow_and_update().clone();
            for snap in snapshots.iter().filter(|s| !s.done && !s.paused) {
                info!(
                    content_id = %snap.content_id,
                    version = %snap.version,
                    percent = snap.percent(),
                    speed = snap.download_speed,
                    "transfer progress"
                );
            }
        }
    };
    tokio::select! {
        _ = shutdown_rx => info!("shutting down"),
        _ = progress => {}
    }
    Ok(())
}

async fn list(launcher: &Launcher) -> anyhow::Result<()> {
    for item in launcher.registry.index_with_progress().await {
        println!("{} ({})", item.entry.id, item.entry.name);
        for (version, snap) in &item.progress {
            match snap {
                Some(s) if s.seeding => println!("  {version}  seeding"),
                Some(s) if s.done => println!("  {version}  done"),
                Some(s) => println!(
                    "  {version}  {}%{}",
                    s.percent(),
                    if s.paused { " (paused)" } else { "" }
                ),
                None => println!("  {version}  -"),
            }
        }
    }
    Ok(())
}

async fn fetch(launcher: &Launcher, id: ContentId, version: Option<String>) -> anyhow::Result<()> {
    let index = launcher.registry.index();
    let (version, info) = match version {
        Some(v) => {
            let info = index.version_info(id, &v)?;
            (v, info)
        }
        None => index.latest_version(id)?,
    };
    let started = launcher.registry.start(&info).await?;
    info!(content_id = %id, %version, info_hash = %started.info_hash, "fetching");
    let ceiling = Duration::from_secs(launcher.config.download_ceiling_secs);
    let done = launcher
        .registry
        .wait_until_done(&started.info_hash, ceiling, |snap| {
            eprint!("\r{}% {} B/s   ", snap.percent(), snap.download_speed);
        })
        .await?;
    eprintln!();
    println!(
        "{id} {version} ready in {}",
        launcher.registry.transfer_dir(id, &version).display()
    );
    info!(bytes = done.total_bytes, "fetch complete");
    Ok(())
}

fn orchestrator(launcher: &Launcher) -> anyhow::Result<UpdateOrchestrator> {
    let helper_source = std::env::current_exe().context("failed to locate the running executable")?;
    let settings = launcher.config.update_settings(
        &launcher.paths,
        env!("CARGO_PKG_VERSION"),
        helper_source,
    );
    let mut orchestrator =
        UpdateOrchestrator::new(launcher.registry.clone(), settings, Arc::new(DetachedLauncher));
    if let Some(stop) = &launcher.config.service_stop_command {
        orchestrator = orchestrator.with_service(Arc::new(CommandService::new(
            launcher.config.service_name.clone(),
            stop.clone(),
            launcher.config.service_start_command.clone(),
        )));
    }
    Ok(orchestrator)
}

fn confirm_prompt(check: &UpdateCheck) -> bool {
    if !io::stdin().is_terminal() {
        println!("update {} available; rerun with --yes to install", check.latest_version);
        return false;
    }
    print!(
        "Update {} -> {} available. Install now? [y/N]: ",
        check.current_version, check.latest_version
    );
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut buf = String::new();
    if io::stdin().read_line(&mut buf).is_err() {
        return false;
    }
    matches!(buf.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn update(launcher: &Launcher, yes: bool) -> anyhow::Result<()> {
    let orchestrator = orchestrator(launcher)?;
    let sink = |event: ProgressEvent| {
        println!("[{:?}] {}", event.status, event.message);
    };
    let outcome = orchestrator
        .run(|check| yes || confirm_prompt(check), &sink)
        .await?;
    match outcome {
        UpdateOutcome::NoUpdate(_) | UpdateOutcome::Declined(_) | UpdateOutcome::Busy => Ok(()),
        UpdateOutcome::HandedOff(handoff) => {
            info!(version = %handoff.version, helper_pid = handoff.helper_pid, "exiting so the helper can replace files");
            // Let the helper settle before the parent disappears.
            tokio::time::sleep(Duration::from_millis(500)).await;
            std::process::exit(0);
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
