use crate::engine::TransportConfig;
use crate::error::{IoContext, Result};
use crate::release::ReleasePolicy;
use crate::update::UpdateSettings;
use dlc_protocol::ContentId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Saved launcher settings. Every field has a default, so an empty JSON
/// object is a valid file. Relative paths are resolved against the app dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub content_root: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub preserve: Vec<PathBuf>,
    pub self_id: ContentId,
    pub main_executable: Option<PathBuf>,
    pub package_suffix: String,
    pub required_entries: Vec<PathBuf>,
    pub poll_interval_ms: u64,
    pub download_ceiling_secs: u64,
    pub destroy_timeout_ms: u64,
    pub parent_exit_timeout_secs: u64,
    pub release: ReleasePolicy,
    pub service_name: String,
    pub service_stop_command: Option<Vec<String>>,
    pub service_start_command: Option<Vec<String>>,
    pub transport: TransportConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            content_root: None,
            manifest_path: None,
            scratch_dir: None,
            state_dir: None,
            preserve: vec![PathBuf::from("data")],
            self_id: ContentId::App,
            main_executable: None,
            package_suffix: ".zip".to_string(),
            required_entries: Vec::new(),
            poll_interval_ms: 1000,
            download_ceiling_secs: 3600,
            destroy_timeout_ms: 3000,
            parent_exit_timeout_secs: 30,
            release: ReleasePolicy::default(),
            service_name: "runtime".to_string(),
            service_stop_command: None,
            service_start_command: None,
            transport: TransportConfig::default(),
        }
    }
}

/// Absolute locations derived once from [`LauncherConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherPaths {
    pub app_dir: PathBuf,
    pub content_root: PathBuf,
    pub manifest_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub staged_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub state_dir: PathBuf,
    pub update_log: PathBuf,
    pub helper_log: PathBuf,
    pub main_executable: PathBuf,
    /// Relative to `app_dir`: user data plus every launcher-owned directory
    /// that lives inside the installation.
    pub preserve: Vec<PathBuf>,
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn default_main_executable() -> PathBuf {
    PathBuf::from(format!("dlc-launcher{}", std::env::consts::EXE_SUFFIX))
}

impl LauncherConfig {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).at(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).at(path)
    }

    pub fn resolve(&self, app_dir: &Path) -> LauncherPaths {
        let content_root = self
            .content_root
            .as_deref()
            .map(|p| absolutize(app_dir, p))
            .unwrap_or_else(|| app_dir.join("external-resources").join("dlc"));
        let manifest_path = self
            .manifest_path
            .as_deref()
            .map(|p| absolutize(app_dir, p))
            .unwrap_or_else(|| content_root.join("dlc-index.json"));
        let scratch_dir = self
            .scratch_dir
            .as_deref()
            .map(|p| absolutize(app_dir, p))
            .unwrap_or_else(|| app_dir.join("update-temp"));
        let state_dir = self
            .state_dir
            .as_deref()
            .map(|p| absolutize(app_dir, p))
            .unwrap_or_else(|| app_dir.join("state"));

        let mut preserve = self.preserve.clone();
        for owned in [&content_root, &scratch_dir, &state_dir] {
            if let Ok(rel) = owned.strip_prefix(app_dir) {
                if !rel.as_os_str().is_empty() && !preserve.iter().any(|p| rel.starts_with(p)) {
                    preserve.push(rel.to_path_buf());
                }
            }
        }

        LauncherPaths {
            app_dir: app_dir.to_path_buf(),
            staged_dir: scratch_dir.join("staged"),
            backup_dir: scratch_dir.join("backup"),
            update_log: state_dir.join("update.log"),
            helper_log: state_dir.join("update-helper.log"),
            main_executable: self
                .main_executable
                .clone()
                .unwrap_or_else(default_main_executable),
            content_root,
            manifest_path,
            scratch_dir,
            state_dir,
            preserve,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn update_settings(
        &self,
        paths: &LauncherPaths,
        current_version: &str,
        helper_source: PathBuf,
    ) -> UpdateSettings {
        UpdateSettings {
            self_id: self.self_id,
            current_version: current_version.to_string(),
            app_dir: paths.app_dir.clone(),
            scratch_dir: paths.scratch_dir.clone(),
            staged_dir: paths.staged_dir.clone(),
            backup_dir: paths.backup_dir.clone(),
            state_dir: paths.state_dir.clone(),
            update_log: paths.update_log.clone(),
            helper_log: paths.helper_log.clone(),
            main_executable: paths.main_executable.clone(),
            package_suffix: self.package_suffix.clone(),
            required_entries: self.required_entries.clone(),
            preserve: paths.preserve.clone(),
            download_ceiling: Duration::from_secs(self.download_ceiling_secs),
            destroy_timeout: Duration::from_millis(self.destroy_timeout_ms),
            parent_exit_timeout: Duration::from_secs(self.parent_exit_timeout_secs),
            release: self.release,
            helper_source,
        }
    }
}

pub fn default_config_path() -> PathBuf {
    if cfg!(target_os = "windows") {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return PathBuf::from(appdata)
                .join("DlcLauncher")
                .join("launcher.json");
        }
    }

    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("dlc-launcher").join("launcher.json");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("dlc-launcher")
            .join("launcher.json");
    }
    PathBuf::from("launcher.json")
}
