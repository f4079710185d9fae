//! Seam between the registry and whatever P2P library moves the bytes.

mod loopback;
#[cfg(feature = "rqbit")]
mod rqbit;

pub use loopback::{LoopbackEngine, LoopbackFile};
#[cfg(feature = "rqbit")]
pub use rqbit::RqbitEngine;

use crate::error::Result;
use async_trait::async_trait;
use dlc_protocol::InfoHash;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Magnet(String),
    Descriptor(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOptions {
    pub output_dir: PathBuf,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub name: Option<String>,
    pub progress_bytes: u64,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub finished: bool,
    pub paused: bool,
    pub has_metadata: bool,
}

/// Network settings handed to the engine at construction. Nothing here is
/// applied process-wide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub trackers: Vec<String>,
    pub listen_port: Option<u16>,
    pub disable_dht: bool,
}

impl TransportConfig {
    pub fn decorate_magnet(&self, magnet: &str) -> String {
        self.trackers.iter().fold(magnet.to_string(), |acc, tracker| {
            if acc.contains(tracker.as_str()) {
                acc
            } else {
                format!("{acc}&tr={tracker}")
            }
        })
    }
}

/// Operations the registry needs from a transfer engine. Implementations key
/// everything by info hash and never hand out their internal objects.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Adds a transfer. Adding a hash the engine already manages returns the
    /// existing hash without creating a second transfer.
    async fn add(&self, source: TransferSource, opts: AddOptions) -> Result<InfoHash>;

    async fn inspect(&self, descriptor: &[u8]) -> Result<InfoHash>;

    async fn pause(&self, hash: &InfoHash) -> Result<()>;

    async fn resume(&self, hash: &InfoHash) -> Result<()>;

    /// Forgets the transfer. Files stay on disk.
    async fn remove(&self, hash: &InfoHash) -> Result<()>;

    /// Stop requesting pieces and only serve what is already verified.
    async fn seed_only(&self, hash: &InfoHash) -> Result<()>;

    /// Stops all I/O for the transfer and closes its file handles.
    async fn shutdown(&self, hash: &InfoHash) -> Result<()>;

    async fn stats(&self, hash: &InfoHash) -> Option<EngineStats>;

    async fn descriptor(&self, hash: &InfoHash) -> Option<Vec<u8>>;

    async fn files(&self, hash: &InfoHash) -> Vec<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trackers_are_appended_once() {
        let transport = TransportConfig {
            trackers: vec!["udp://tracker.local:6969".into()],
            ..Default::default()
        };
        let magnet = "magnet:?xt=urn:btih:aaaa";
        let decorated = transport.decorate_magnet(magnet);
        assert_eq!(decorated, "magnet:?xt=urn:btih:aaaa&tr=udp://tracker.local:6969");
        assert_eq!(transport.decorate_magnet(&decorated), decorated);
    }

    #[test]
    fn network_engine_is_in_the_default_build() {
        assert!(cfg!(feature = "rqbit"), "default features must include `rqbit`");
    }
}
