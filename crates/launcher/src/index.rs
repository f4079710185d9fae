//! Read-only view over the trusted content manifest.
//!
//! The manifest is a JSON array of [`ContentEntry`]. Loading never fails: a
//! missing or unreadable manifest yields an empty index so callers degrade to
//! "nothing available" instead of crashing.

use crate::error::{DlcError, Result};
use dlc_protocol::{ContentEntry, ContentId, InfoHash, VersionInfo};
use semver::Version;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    entries: Vec<ContentEntry>,
}

/// Reverse lookup result for a transfer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTransfer {
    pub content_id: ContentId,
    pub version: String,
    pub info: VersionInfo,
}

impl ContentIndex {
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "content manifest unavailable, using empty index");
                return Self::default();
            }
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "content manifest is corrupt, using empty index");
                return Self::default();
            }
        };

        let mut entries = Vec::with_capacity(values.len());
        for value in values {
            let raw_id = value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("<missing>")
                .to_string();
            match serde_json::from_value::<ContentEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(id = %raw_id, error = %err, "skipping manifest entry"),
            }
        }
        debug!(path = %path.display(), entries = entries.len(), "content manifest loaded");
        Self::from_entries(entries)
    }

    pub fn from_entries(entries: Vec<ContentEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ContentEntry] {
        &self.entries
    }

    pub fn entry(&self, id: ContentId) -> Option<&ContentEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Highest version of `id` under semver ordering.
    pub fn latest_version(&self, id: ContentId) -> Result<(String, VersionInfo)> {
        let entry = self
            .entry(id)
            .ok_or_else(|| DlcError::NotFound(format!("content id {id}")))?;

        let mut best: Option<(Version, &String, &VersionInfo)> = None;
        for (key, info) in &entry.versions {
            let parsed = Version::parse(key).map_err(|e| DlcError::invalid_version(key, e))?;
            if best.as_ref().map_or(true, |(current, _, _)| parsed > *current) {
                best = Some((parsed, key, info));
            }
        }
        best.map(|(_, key, info)| (key.clone(), info.clone()))
            .ok_or_else(|| DlcError::NotFound(format!("no versions listed for {id}")))
    }

    pub fn version_info(&self, id: ContentId, version: &str) -> Result<VersionInfo> {
        self.entry(id)
            .and_then(|e| e.versions.get(version))
            .cloned()
            .ok_or_else(|| DlcError::NotFound(format!("{id} version {version}")))
    }

    pub fn is_latest_version(&self, id: ContentId, version: &str) -> Result<bool> {
        let (latest, _) = self.latest_version(id)?;
        let latest = Version::parse(&latest).map_err(|e| DlcError::invalid_version(&latest, e))?;
        let candidate = Version::parse(version).map_err(|e| DlcError::invalid_version(version, e))?;
        Ok(candidate >= latest)
    }

    /// Finds the entry and version whose magnet carries the same info hash.
    /// Accepts a magnet uri or a bare hash; anything unparseable is "none".
    pub fn resolve_by_transfer_id(&self, magnet_or_hash: &str) -> Option<ResolvedTransfer> {
        let wanted = InfoHash::from_transfer_id(magnet_or_hash).ok()?;
        self.resolve_hash(&wanted)
    }

    pub fn resolve_hash(&self, wanted: &InfoHash) -> Option<ResolvedTransfer> {
        self.entries.iter().find_map(|entry| {
            entry.versions.iter().find_map(|(version, info)| {
                match info.info_hash() {
                    Ok(hash) if &hash == wanted => Some(ResolvedTransfer {
                        content_id: entry.id,
                        version: version.clone(),
                        info: info.clone(),
                    }),
                    _ => None,
                }
            })
        })
    }

    pub fn is_known_transfer_id(&self, hash: &str) -> bool {
        self.resolve_by_transfer_id(hash).is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    pub(crate) fn magnet(hash_byte: char) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn=payload",
            std::iter::repeat(hash_byte).take(40).collect::<String>()
        )
    }

    fn entry(id: ContentId, versions: &[(&str, char)]) -> ContentEntry {
        let versions = versions
            .iter()
            .map(|(v, h)| (v.to_string(), VersionInfo::new(magnet(*h))))
            .collect::<BTreeMap<_, _>>();
        ContentEntry {
            id,
            name: id.to_string(),
            versions,
        }
    }

    #[test]
    fn latest_version_uses_semver_not_string_order() {
        // "1.10.0" < "1.9.0" lexically, so the BTreeMap order would be wrong.
        let index = ContentIndex::from_entries(vec![entry(
            ContentId::App,
            &[("1.9.0", 'a'), ("1.10.0", 'b'), ("1.2.0", 'c')],
        )]);
        let (version, info) = index.latest_version(ContentId::App).unwrap();
        assert_eq!(version, "1.10.0");
        assert_eq!(info.magnet, magnet('b'));
        assert!(index.is_latest_version(ContentId::App, "1.10.0").unwrap());
        assert!(!index.is_latest_version(ContentId::App, "1.9.0").unwrap());
    }

    #[test]
    fn latest_version_errors() {
        let index = ContentIndex::from_entries(vec![
            entry(ContentId::PdfTar, &[]),
            entry(ContentId::VoiceTar, &[("not-a-version", 'a')]),
        ]);
        assert!(matches!(index.latest_version(ContentId::App), Err(DlcError::NotFound(_))));
        assert!(matches!(index.latest_version(ContentId::PdfTar), Err(DlcError::NotFound(_))));
        assert!(matches!(
            index.latest_version(ContentId::VoiceTar),
            Err(DlcError::InvalidVersion { .. })
        ));
        assert!(matches!(
            index.version_info(ContentId::PdfTar, "1.0.0"),
            Err(DlcError::NotFound(_))
        ));
    }

    #[test]
    fn load_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ContentIndex::load(&dir.path().join("nope.json"));
        assert!(missing.entries().is_empty());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{ not json").unwrap();
        assert!(ContentIndex::load(&corrupt).entries().is_empty());
    }

    #[test]
    fn load_skips_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlc-index.json");
        let body = format!(
            r#"[
                {{"id":"ROGUE","name":"x","versions":{{"1.0.0":{{"magnetUri":"{a}"}}}}}},
                {{"id":"TEST_FILE","name":"Test","versions":{{"1.0.0":{{"magnetUri":"{b}"}}}}}}
            ]"#,
            a = magnet('a'),
            b = magnet('b'),
        );
        std::fs::write(&path, body).unwrap();
        let index = ContentIndex::load(&path);
        assert_eq!(index.entries().len(), 1);
        assert_eq!(index.entries()[0].id, ContentId::TestFile);
    }

    #[test]
    fn resolve_by_transfer_id_matches_hash_case_insensitively() {
        let index = ContentIndex::from_entries(vec![entry(
            ContentId::TrainingTar,
            &[("1.0.0", 'a'), ("2.0.0", 'b')],
        )]);
        let resolved = index.resolve_by_transfer_id(&"B".repeat(40)).unwrap();
        assert_eq!(resolved.content_id, ContentId::TrainingTar);
        assert_eq!(resolved.version, "2.0.0");
        assert!(index.is_known_transfer_id(&magnet('a')));
        assert!(!index.is_known_transfer_id(&"c".repeat(40)));
        assert!(!index.is_known_transfer_id("garbage"));
    }
}
