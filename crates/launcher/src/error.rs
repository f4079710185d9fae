use dlc_protocol::ProtocolError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DlcError>;

#[derive(Debug, Error)]
pub enum DlcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid version `{version}`: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(#[from] ProtocolError),

    #[error("file {path} still locked after {attempts} attempts")]
    ReleaseTimeout { path: PathBuf, attempts: u32 },

    #[error("download of {info_hash} stalled at {percent}% ({downloaded_bytes} bytes) after {elapsed:?}")]
    DownloadTimeout {
        info_hash: String,
        percent: u8,
        downloaded_bytes: u64,
        elapsed: Duration,
    },

    #[error("transfer {0} was removed while waiting for completion")]
    TransferRemoved(String),

    #[error("package verification failed: {0}")]
    VerificationFailed(String),

    #[error("replacement failed: {reason} (restored: {restored})")]
    ReplacementFailed { reason: String, restored: bool },

    #[error("another update is already in progress")]
    Busy,

    #[error("transfer engine error: {0}")]
    Engine(String),

    #[error("runtime service error: {0}")]
    Service(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DlcError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DlcError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_version(version: &str, err: impl std::fmt::Display) -> Self {
        DlcError::InvalidVersion {
            version: version.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Attaches a path to raw `std::io` results.
pub trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| DlcError::io(path, e))
    }
}
