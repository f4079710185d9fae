//! In-process engine with no networking. Content is "published" into a local
//! swarm and delivered straight to disk when a transfer runs. Used for offline
//! operation and by the test suites.

use super::{AddOptions, EngineStats, TransferEngine, TransferSource};
use crate::error::{DlcError, IoContext, Result};
use async_trait::async_trait;
use dlc_protocol::InfoHash;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackFile {
    pub path: String,
    pub data: Vec<u8>,
}

impl LoopbackFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Descriptor {
    info_hash: InfoHash,
    name: String,
    files: Vec<DescriptorFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorFile {
    path: String,
    len: u64,
}

#[derive(Debug, Clone)]
struct Published {
    name: String,
    files: Vec<LoopbackFile>,
}

impl Published {
    fn descriptor(&self, hash: &InfoHash) -> Descriptor {
        Descriptor {
            info_hash: hash.clone(),
            name: self.name.clone(),
            files: self
                .files
                .iter()
                .map(|f| DescriptorFile {
                    path: f.path.clone(),
                    len: f.data.len() as u64,
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Transfer {
    output_dir: PathBuf,
    meta: Option<Descriptor>,
    progress_bytes: u64,
    paused: bool,
    finished: bool,
    seeding: bool,
}

impl Transfer {
    fn total_bytes(&self) -> u64 {
        self.meta
            .as_ref()
            .map(|m| m.files.iter().map(|f| f.len).sum())
            .unwrap_or(0)
    }

    /// Recomputes progress from what is already on disk.
    fn scan(&mut self) {
        let Some(meta) = &self.meta else {
            return;
        };
        self.progress_bytes = meta
            .files
            .iter()
            .map(|f| {
                std::fs::metadata(self.output_dir.join(&f.path))
                    .map(|m| m.len().min(f.len))
                    .unwrap_or(0)
            })
            .sum();
        self.finished = self.progress_bytes == self.total_bytes();
    }
}

#[derive(Default)]
struct State {
    swarm: HashMap<InfoHash, Published>,
    transfers: HashMap<InfoHash, Transfer>,
}

#[derive(Default)]
pub struct LoopbackEngine {
    state: Mutex<State>,
    adds: AtomicUsize,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes content available to transfers of `hash`.
    pub fn publish(&self, hash: InfoHash, name: impl Into<String>, files: Vec<LoopbackFile>) {
        let mut state = self.lock();
        state.swarm.insert(
            hash,
            Published {
                name: name.into(),
                files,
            },
        );
    }

    /// Number of transfers actually created (idempotent re-adds excluded).
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.lock().transfers.len()
    }

    pub fn is_seeding(&self, hash: &InfoHash) -> bool {
        self.lock()
            .transfers
            .get(hash)
            .map(|t| t.seeding)
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(state: &mut State, hash: &InfoHash) -> Result<()> {
        let Some(published) = state.swarm.get(hash).cloned() else {
            return Ok(());
        };
        let Some(transfer) = state.transfers.get_mut(hash) else {
            return Ok(());
        };
        if transfer.paused || transfer.finished {
            return Ok(());
        }
        if transfer.meta.is_none() {
            transfer.meta = Some(published.descriptor(hash));
        }
        for file in &published.files {
            let target = transfer.output_dir.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).at(parent)?;
            }
            std::fs::write(&target, &file.data).at(&target)?;
        }
        transfer.scan();
        debug!(info_hash = %hash, bytes = transfer.progress_bytes, "loopback delivery complete");
        Ok(())
    }
}

fn is_relative_plain(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

/// Rejects descriptors whose file list would reach outside the output
/// directory.
fn decode_descriptor(bytes: &[u8]) -> Result<Descriptor> {
    let meta: Descriptor =
        serde_json::from_slice(bytes).map_err(|e| DlcError::Engine(format!("bad descriptor: {e}")))?;
    if let Some(bad) = meta.files.iter().find(|f| !is_relative_plain(&f.path)) {
        return Err(DlcError::Engine(format!(
            "bad descriptor: file path `{}` escapes the output directory",
            bad.path
        )));
    }
    Ok(meta)
}

#[async_trait]
impl TransferEngine for LoopbackEngine {
    async fn add(&self, source: TransferSource, opts: AddOptions) -> Result<InfoHash> {
        let mut state = self.lock();
        let (hash, meta) = match source {
            TransferSource::Magnet(uri) => {
                let hash = InfoHash::from_magnet(&uri)?;
                let meta = state.swarm.get(&hash).map(|p| p.descriptor(&hash));
                (hash, meta)
            }
            TransferSource::Descriptor(bytes) => {
                let meta = decode_descriptor(&bytes)?;
                (meta.info_hash.clone(), Some(meta))
            }
        };
        if state.transfers.contains_key(&hash) {
            return Ok(hash);
        }

        std::fs::create_dir_all(&opts.output_dir).at(&opts.output_dir)?;
        let mut transfer = Transfer {
            output_dir: opts.output_dir,
            meta,
            progress_bytes: 0,
            paused: opts.paused,
            finished: false,
            seeding: false,
        };
        transfer.scan();
        state.transfers.insert(hash.clone(), transfer);
        self.adds.fetch_add(1, Ordering::SeqCst);
        Self::deliver(&mut state, &hash)?;
        Ok(hash)
    }

    async fn inspect(&self, descriptor: &[u8]) -> Result<InfoHash> {
        Ok(decode_descriptor(descriptor)?.info_hash)
    }

    async fn pause(&self, hash: &InfoHash) -> Result<()> {
        if let Some(t) = self.lock().transfers.get_mut(hash) {
            t.paused = true;
        }
        Ok(())
    }

    async fn resume(&self, hash: &InfoHash) -> Result<()> {
        let mut state = self.lock();
        if let Some(t) = state.transfers.get_mut(hash) {
            t.paused = false;
        }
        Self::deliver(&mut state, hash)
    }

    async fn remove(&self, hash: &InfoHash) -> Result<()> {
        self.lock().transfers.remove(hash);
        Ok(())
    }

    async fn seed_only(&self, hash: &InfoHash) -> Result<()> {
        if let Some(t) = self.lock().transfers.get_mut(hash) {
            t.seeding = true;
            t.paused = false;
        }
        Ok(())
    }

    async fn shutdown(&self, hash: &InfoHash) -> Result<()> {
        self.lock().transfers.remove(hash);
        Ok(())
    }

    async fn stats(&self, hash: &InfoHash) -> Option<EngineStats> {
        let state = self.lock();
        let t = state.transfers.get(hash)?;
        Some(EngineStats {
            name: t.meta.as_ref().map(|m| m.name.clone()),
            progress_bytes: t.progress_bytes,
            total_bytes: t.total_bytes(),
            uploaded_bytes: 0,
            finished: t.meta.is_some() && t.finished,
            paused: t.paused,
            has_metadata: t.meta.is_some(),
        })
    }

    async fn descriptor(&self, hash: &InfoHash) -> Option<Vec<u8>> {
        let state = self.lock();
        let meta = state.transfers.get(hash)?.meta.as_ref()?;
        serde_json::to_vec(meta).ok()
    }

    async fn files(&self, hash: &InfoHash) -> Vec<PathBuf> {
        let state = self.lock();
        let Some(t) = state.transfers.get(hash) else {
            return Vec::new();
        };
        t.meta
            .as_ref()
            .map(|m| m.files.iter().map(|f| t.output_dir.join(&f.path)).collect())
            .unwrap_or_default()
    }
}
