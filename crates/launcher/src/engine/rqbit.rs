//! BitTorrent engine backed by librqbit.

use super::{AddOptions, EngineStats, TransferEngine, TransferSource, TransportConfig};
use crate::error::{DlcError, Result};
use async_trait::async_trait;
use dlc_protocol::InfoHash;
use librqbit::api::TorrentIdOrHash;
use librqbit::{
    AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session,
    SessionOptions,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

type ManagedTorrentHandle = Arc<ManagedTorrent>;

pub struct RqbitEngine {
    session: Arc<Session>,
    transport: TransportConfig,
    outputs: Mutex<HashMap<InfoHash, PathBuf>>,
}

fn engine_err(err: impl std::fmt::Display) -> DlcError {
    DlcError::Engine(err.to_string())
}

impl RqbitEngine {
    pub async fn new(default_output: PathBuf, transport: TransportConfig) -> Result<Self> {
        let opts = SessionOptions {
            disable_dht: transport.disable_dht,
            listen_port_range: transport.listen_port.map(|p| p..p.saturating_add(1)),
            ..Default::default()
        };
        let session = Session::new_with_opts(default_output, opts)
            .await
            .map_err(engine_err)?;
        info!(trackers = transport.trackers.len(), dht = !transport.disable_dht, "rqbit session ready");
        Ok(Self {
            session,
            transport,
            outputs: Mutex::new(HashMap::new()),
        })
    }

    fn handle(&self, hash: &InfoHash) -> Option<ManagedTorrentHandle> {
        let id = TorrentIdOrHash::try_from(hash.as_str()).ok()?;
        self.session.get(id)
    }

    fn hash_of(handle: &ManagedTorrentHandle) -> Result<InfoHash> {
        Ok(InfoHash::parse(&handle.info_hash().as_string())?)
    }

    fn outputs(&self) -> std::sync::MutexGuard<'_, HashMap<InfoHash, PathBuf>> {
        self.outputs.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn delete(&self, hash: &InfoHash) -> Result<()> {
        let Ok(id) = TorrentIdOrHash::try_from(hash.as_str()) else {
            return Ok(());
        };
        if self.session.get(id).is_none() {
            return Ok(());
        }
        self.session.delete(id, false).await.map_err(engine_err)?;
        self.outputs().remove(hash);
        Ok(())
    }
}

#[async_trait]
impl TransferEngine for RqbitEngine {
    async fn add(&self, source: TransferSource, opts: AddOptions) -> Result<InfoHash> {
        let add = match source {
            TransferSource::Magnet(uri) => AddTorrent::from_url(self.transport.decorate_magnet(&uri)),
            TransferSource::Descriptor(bytes) => AddTorrent::from_bytes(bytes),
        };
        let add_opts = AddTorrentOptions {
            paused: opts.paused,
            output_folder: Some(opts.output_dir.to_string_lossy().to_string()),
            overwrite: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(add, Some(add_opts))
            .await
            .map_err(engine_err)?;
        let handle = match response {
            AddTorrentResponse::Added(_, handle) | AddTorrentResponse::AlreadyManaged(_, handle) => handle,
            AddTorrentResponse::ListOnly(_) => {
                return Err(DlcError::Engine("unexpected list-only response".into()))
            }
        };
        let hash = Self::hash_of(&handle)?;
        self.outputs().entry(hash.clone()).or_insert(opts.output_dir);
        Ok(hash)
    }

    async fn inspect(&self, descriptor: &[u8]) -> Result<InfoHash> {
        let opts = AddTorrentOptions {
            list_only: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(AddTorrent::from_bytes(descriptor.to_vec()), Some(opts))
            .await
            .map_err(engine_err)?;
        match response {
            AddTorrentResponse::ListOnly(listed) => Ok(InfoHash::parse(&listed.info_hash.as_string())?),
            AddTorrentResponse::Added(_, handle) | AddTorrentResponse::AlreadyManaged(_, handle) => {
                Self::hash_of(&handle)
            }
        }
    }

    async fn pause(&self, hash: &InfoHash) -> Result<()> {
        if let Some(handle) = self.handle(hash) {
            self.session.pause(&handle).await.map_err(engine_err)?;
        }
        Ok(())
    }

    async fn resume(&self, hash: &InfoHash) -> Result<()> {
        if let Some(handle) = self.handle(hash) {
            if handle.is_paused() {
                self.session.unpause(&handle).await.map_err(engine_err)?;
            }
        }
        Ok(())
    }

    async fn remove(&self, hash: &InfoHash) -> Result<()> {
        self.delete(hash).await
    }

    async fn seed_only(&self, hash: &InfoHash) -> Result<()> {
        // rqbit never re-requests verified pieces, so a finished torrent that is
        // unpaused only uploads.
        if let Some(handle) = self.handle(hash) {
            if handle.is_paused() {
                self.session.unpause(&handle).await.map_err(engine_err)?;
            }
        }
        Ok(())
    }

    async fn shutdown(&self, hash: &InfoHash) -> Result<()> {
        if let Some(handle) = self.handle(hash) {
            if let Err(err) = self.session.pause(&handle).await {
                warn!(info_hash = %hash, error = %err, "pause before teardown failed");
            }
        }
        self.delete(hash).await
    }

    async fn stats(&self, hash: &InfoHash) -> Option<EngineStats> {
        let handle = self.handle(hash)?;
        let stats = handle.stats();
        let has_metadata = handle.with_metadata(|_| ()).is_ok();
        Some(EngineStats {
            name: handle.name(),
            progress_bytes: stats.progress_bytes,
            total_bytes: stats.total_bytes,
            uploaded_bytes: stats.uploaded_bytes,
            finished: stats.finished,
            paused: handle.is_paused(),
            has_metadata,
        })
    }

    async fn descriptor(&self, hash: &InfoHash) -> Option<Vec<u8>> {
        let handle = self.handle(hash)?;
        handle
            .with_metadata(|meta| meta.torrent_bytes.to_vec())
            .ok()
            .filter(|bytes| !bytes.is_empty())
    }

    async fn files(&self, hash: &InfoHash) -> Vec<PathBuf> {
        let Some(handle) = self.handle(hash) else {
            return Vec::new();
        };
        let Some(root) = self.outputs().get(hash).cloned() else {
            return Vec::new();
        };
        handle
            .with_metadata(|meta| {
                meta.file_infos
                    .iter()
                    .map(|fi| root.join(&fi.relative_filename))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }
}
