use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown content id `{0}`")]
    UnknownContentId(String),
    #[error("invalid info hash `{0}`: expected 40 hex characters")]
    InvalidInfoHash(String),
    #[error("magnet uri has no usable `xt` parameter: {0}")]
    MissingExactTopic(String),
}

/// Every piece of content the launcher knows how to provision. Content is
/// pre-registered; manifests cannot introduce new ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContentId {
    #[serde(rename = "PDF_TAR")]
    PdfTar,
    #[serde(rename = "VOICE_TAR")]
    VoiceTar,
    #[serde(rename = "TRAINING_TAR")]
    TrainingTar,
    #[serde(rename = "TRAINING_VOICE_TAR")]
    TrainingVoiceTar,
    #[serde(rename = "LMSTUDIO_WINDOWS")]
    LmStudioWindows,
    #[serde(rename = "TEST_FILE")]
    TestFile,
    #[serde(rename = "APP", alias = "AI_LEARNING_ASSISTANT_LAUNCHER")]
    App,
}

impl ContentId {
    pub const ALL: [ContentId; 7] = [
        ContentId::PdfTar,
        ContentId::VoiceTar,
        ContentId::TrainingTar,
        ContentId::TrainingVoiceTar,
        ContentId::LmStudioWindows,
        ContentId::TestFile,
        ContentId::App,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentId::PdfTar => "PDF_TAR",
            ContentId::VoiceTar => "VOICE_TAR",
            ContentId::TrainingTar => "TRAINING_TAR",
            ContentId::TrainingVoiceTar => "TRAINING_VOICE_TAR",
            ContentId::LmStudioWindows => "LMSTUDIO_WINDOWS",
            ContentId::TestFile => "TEST_FILE",
            ContentId::App => "APP",
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "AI_LEARNING_ASSISTANT_LAUNCHER" {
            return Ok(ContentId::App);
        }
        ContentId::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownContentId(s.to_string()))
    }
}

/// Decodes `%XX` escapes and `+` in a query component. Malformed escapes are
/// kept as written.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .filter(|hex| hex.iter().all(u8::is_ascii_hexdigit))
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match (escaped, bytes[i]) {
            (Some(byte), _) => {
                out.push(byte);
                i += 3;
            }
            (None, b'+') => {
                out.push(b' ');
                i += 1;
            }
            (None, other) => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// BitTorrent v1 info hash, normalised to lowercase hex. This is the join key
/// between index entries, descriptor files and live transfers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InfoHash(String);

impl InfoHash {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let trimmed = raw.trim();
        if trimmed.len() != 40 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProtocolError::InvalidInfoHash(raw.to_string()));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Extracts the hash from the `xt` parameter of a magnet uri. The hash is
    /// the last `:`-separated segment of the exact topic (`urn:btih:<hash>`).
    pub fn from_magnet(uri: &str) -> Result<Self, ProtocolError> {
        let query = uri
            .split_once('?')
            .map(|(_, q)| q)
            .ok_or_else(|| ProtocolError::MissingExactTopic(uri.to_string()))?;
        query
            .split(['&', '#'])
            .filter_map(|pair| pair.split_once('='))
            .filter(|(key, _)| percent_decode(key).eq_ignore_ascii_case("xt"))
            .find_map(|(_, value)| {
                let decoded = percent_decode(value);
                decoded.rsplit(':').next().and_then(|h| Self::parse(h).ok())
            })
            .ok_or_else(|| ProtocolError::MissingExactTopic(uri.to_string()))
    }

    pub fn from_transfer_id(id: &str) -> Result<Self, ProtocolError> {
        if id.trim_start().to_ascii_lowercase().starts_with("magnet:") {
            Self::from_magnet(id)
        } else {
            Self::parse(id)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for InfoHash {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<InfoHash> for String {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(alias = "magnetUri")]
    pub magnet: String,
    #[serde(default, rename = "httpFallback", skip_serializing_if = "Option::is_none")]
    pub http_fallback: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requires: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl VersionInfo {
    pub fn new(magnet: impl Into<String>) -> Self {
        Self {
            magnet: magnet.into(),
            http_fallback: None,
            requires: BTreeMap::new(),
            comment: None,
            sha256: None,
        }
    }

    pub fn info_hash(&self) -> Result<InfoHash, ProtocolError> {
        InfoHash::from_magnet(&self.magnet)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub id: ContentId,
    pub name: String,
    #[serde(default)]
    pub versions: BTreeMap<String, VersionInfo>,
}

/// Copy-out view of a live transfer. Holds primitives only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub info_hash: InfoHash,
    pub content_id: ContentId,
    pub version: String,
    pub name: Option<String>,
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub paused: bool,
    pub done: bool,
    pub seeding: bool,
}

impl TransferSnapshot {
    pub fn percent(&self) -> u8 {
        (self.progress.clamp(0.0, 1.0) * 100.0).floor() as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Downloading,
    Installing,
    Done,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub percent: u8,
    pub status: StatusKind,
    pub message: String,
    #[serde(default)]
    pub bytes_per_sec: u64,
}

impl ProgressEvent {
    pub fn downloading(percent: u8, bytes_per_sec: u64) -> Self {
        Self {
            percent: percent.min(100),
            status: StatusKind::Downloading,
            message: format!("update downloading ({percent}%)"),
            bytes_per_sec,
        }
    }

    pub fn installing(message: impl Into<String>) -> Self {
        Self {
            percent: 100,
            status: StatusKind::Installing,
            message: message.into(),
            bytes_per_sec: 0,
        }
    }

    pub fn done(message: impl Into<String>) -> Self {
        Self {
            percent: 100,
            status: StatusKind::Done,
            message: message.into(),
            bytes_per_sec: 0,
        }
    }

    pub fn idle(message: impl Into<String>) -> Self {
        Self {
            percent: 0,
            status: StatusKind::Idle,
            message: message.into(),
            bytes_per_sec: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheck {
    pub current_version: String,
    pub latest_version: String,
    pub have_new: bool,
}

/// Result the update helper leaves behind for the next launch to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateReport {
    Applied {
        version: String,
        finished_at: String,
    },
    Failed {
        version: String,
        reason: String,
        restored: bool,
        finished_at: String,
    },
}

impl UpdateReport {
    pub fn user_message(&self) -> String {
        match self {
            UpdateReport::Applied { version, .. } => {
                format!("update to {version} applied, restarting")
            }
            UpdateReport::Failed {
                reason,
                restored: true,
                ..
            } => format!("update failed: {reason}, previous version restored"),
            UpdateReport::Failed { reason, .. } => {
                format!("update failed: {reason}, previous version could not be restored")
            }
        }
    }
}
