#![allow(dead_code)]

use dlc_launcher::config::{LauncherConfig, LauncherPaths};
use dlc_launcher::engine::LoopbackEngine;
use dlc_launcher::registry::TransferRegistry;
use dlc_launcher::update::helper::ProcessLauncher;
use dlc_launcher::update::UpdateOrchestrator;
use dlc_protocol::{ContentEntry, ContentId, InfoHash, ProgressEvent, VersionInfo};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const HELPER_PID: u32 = 4242;

pub fn hash(c: char) -> InfoHash {
    InfoHash::parse(&c.to_string().repeat(40)).expect("valid test hash")
}

pub fn magnet(c: char) -> String {
    format!("magnet:?xt=urn:btih:{}&dn=test", c.to_string().repeat(40))
}

pub fn entry(id: ContentId, versions: &[(&str, VersionInfo)]) -> ContentEntry {
    ContentEntry {
        id,
        name: id.to_string(),
        versions: versions
            .iter()
            .map(|(v, info)| (v.to_string(), info.clone()))
            .collect(),
    }
}

pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        zip.start_file(*name, SimpleFileOptions::default().unix_permissions(0o755))
            .expect("start zip entry");
        zip.write_all(data.as_bytes()).expect("write zip entry");
    }
    zip.finish().expect("finish zip").into_inner()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Records every spawn instead of starting a process.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<(PathBuf, Vec<OsString>)>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<(PathBuf, Vec<OsString>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ProcessLauncher for Recorder {
    fn spawn_detached(&self, program: &Path, args: &[OsString], _cwd: &Path) -> dlc_launcher::Result<u32> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec()));
        Ok(HELPER_PID)
    }
}

/// Collects progress events handed to the sink.
#[derive(Default)]
pub struct Events(Mutex<Vec<ProgressEvent>>);

impl Events {
    pub fn push(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }

    pub fn messages(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|e| e.message.clone()).collect()
    }

    pub fn all(&self) -> Vec<ProgressEvent> {
        self.0.lock().unwrap().clone()
    }
}

/// An installed application at version 1.0.0 with a content root inside the
/// install directory and a loopback engine in place of the swarm.
pub struct App {
    pub dir: TempDir,
    pub config: LauncherConfig,
    pub paths: LauncherPaths,
    pub engine: Arc<LoopbackEngine>,
    pub registry: Arc<TransferRegistry>,
}

impl App {
    pub fn new(entries: Vec<ContentEntry>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let app_dir = dir.path().join("app");
        for (rel, data) in [
            ("dlc-launcher", "v1"),
            ("lib/core.txt", "old core"),
            ("data/user.txt", "keep me"),
        ] {
            let path = app_dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
        std::fs::write(dir.path().join("helper-bin"), b"helper").unwrap();

        let config = LauncherConfig {
            main_executable: Some(PathBuf::from("dlc-launcher")),
            poll_interval_ms: 20,
            download_ceiling_secs: 30,
            ..Default::default()
        };
        let paths = config.resolve(&app_dir);
        std::fs::create_dir_all(&paths.content_root).unwrap();
        std::fs::write(&paths.manifest_path, serde_json::to_vec(&entries).unwrap()).unwrap();

        let engine = Arc::new(LoopbackEngine::new());
        let registry = Self::registry_for(&config, &paths, engine.clone());
        Self {
            dir,
            config,
            paths,
            engine,
            registry,
        }
    }

    fn registry_for(
        config: &LauncherConfig,
        paths: &LauncherPaths,
        engine: Arc<LoopbackEngine>,
    ) -> Arc<TransferRegistry> {
        Arc::new(TransferRegistry::new(
            engine,
            paths.manifest_path.clone(),
            paths.content_root.clone(),
            config.poll_interval(),
        ))
    }

    /// Simulates a process restart: fresh engine and registry over the same
    /// directories.
    pub fn restart(&mut self) {
        self.engine = Arc::new(LoopbackEngine::new());
        self.registry = Self::registry_for(&self.config, &self.paths, self.engine.clone());
    }

    pub fn orchestrator(&self, current_version: &str) -> (UpdateOrchestrator, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let settings = self.config.update_settings(
            &self.paths,
            current_version,
            self.dir.path().join("helper-bin"),
        );
        let orchestrator = UpdateOrchestrator::new(self.registry.clone(), settings, recorder.clone());
        (orchestrator, recorder)
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.paths.app_dir.join(rel)).unwrap_or_default()
    }
}
