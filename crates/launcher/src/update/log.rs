//! Append-only update trail, kept apart from the application log so a failed
//! update stays diagnosable after the binary that would log it is replaced.

use crate::error::{IoContext, Result};
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

#[derive(Debug)]
pub struct UpdateLog {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl UpdateLog {
    /// Nothing touches the disk until the first line is written.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_limit(path, DEFAULT_MAX_BYTES)
    }

    pub fn with_limit(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".old");
        PathBuf::from(name)
    }

    /// Moves the current file to `<name>.old`, replacing any older generation.
    pub fn rotate(&self) -> Result<()> {
        let rotated = self.rotated_path();
        if rotated.exists() {
            std::fs::remove_file(&rotated).at(&rotated)?;
        }
        std::fs::rename(&self.path, &rotated).at(&self.path)
    }

    pub fn write(&self, level: LogLevel, message: &str, context: Value) -> Result<()> {
        match level {
            LogLevel::Info => tracing::info!(target: "update_log", context = %context, "{message}"),
            LogLevel::Warn => tracing::warn!(target: "update_log", context = %context, "{message}"),
            LogLevel::Error => tracing::error!(target: "update_log", context = %context, "{message}"),
        }

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size > self.max_bytes {
            self.rotate()?;
        }

        let mut line = format!(
            "[{}] [{}] {}",
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level,
            message
        );
        if !context.is_null() {
            line.push(' ');
            line.push_str(&context.to_string());
        }
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .at(&self.path)?;
        file.write_all(line.as_bytes()).at(&self.path)
    }

    /// Logging must never abort an update step; failures go to tracing only.
    fn record(&self, level: LogLevel, message: &str, context: Value) {
        if let Err(err) = self.write(level, message, context) {
            tracing::warn!(path = %self.path.display(), error = %err, "update log write failed");
        }
    }

    pub fn info(&self, message: &str, context: Value) {
        self.record(LogLevel::Info, message, context);
    }

    pub fn warn(&self, message: &str, context: Value) {
        self.record(LogLevel::Warn, message, context);
    }

    pub fn error(&self, message: &str, context: Value) {
        self.record(LogLevel::Error, message, context);
    }
}
