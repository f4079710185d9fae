//! Sole owner of live transfers.
//!
//! Callers see copy-out [`TransferSnapshot`]s only. Every mutation goes through
//! the registry. Concurrent `start` calls for the same hash share one start
//! slot and collapse onto a single transfer; the handle table is never locked
//! while the engine adds a transfer or the disk is written.

use crate::engine::{AddOptions, TransferEngine, TransferSource};
use crate::error::{DlcError, IoContext, Result};
use crate::index::ContentIndex;
use crate::persistence::{self, SaveOutcome};
use dlc_protocol::{ContentEntry, ContentId, InfoHash, TransferSnapshot, VersionInfo};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct Handle {
    content_id: ContentId,
    version: String,
    dir: PathBuf,
    seeding: bool,
    descriptor_saved: bool,
    last_bytes: u64,
    last_uploaded: u64,
    last_poll: Instant,
    download_speed: u64,
    upload_speed: u64,
}

impl Handle {
    fn new(content_id: ContentId, version: String, dir: PathBuf) -> Self {
        Self {
            content_id,
            version,
            dir,
            seeding: false,
            descriptor_saved: false,
            last_bytes: 0,
            last_uploaded: 0,
            last_poll: Instant::now(),
            download_speed: 0,
            upload_speed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached { seeding: bool },
    AlreadyRegistered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedContent {
    pub entry: ContentEntry,
    pub progress: BTreeMap<String, Option<TransferSnapshot>>,
}

pub struct TransferRegistry {
    engine: Arc<dyn TransferEngine>,
    manifest_path: PathBuf,
    content_root: PathBuf,
    poll_interval: Duration,
    handles: Mutex<HashMap<InfoHash, Handle>>,
    starting: StdMutex<HashMap<InfoHash, Arc<OnceCell<()>>>>,
    snapshots: watch::Sender<Vec<TransferSnapshot>>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

fn rate(delta: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs < 0.05 {
        return 0;
    }
    (delta as f64 / secs).round() as u64
}

fn delete_confined(dir: &Path, files: Vec<PathBuf>) {
    let root = match dir.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "transfer directory gone, nothing to delete");
            return;
        }
    };
    for file in files {
        let resolved = match file.canonicalize() {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => {
                warn!(path = %file.display(), error = %err, "failed to resolve transfer file");
                continue;
            }
        };
        if !resolved.starts_with(&root) || resolved == root {
            warn!(path = %file.display(), dir = %dir.display(), "transfer file outside its directory, not deleted");
            continue;
        }
        match std::fs::remove_file(&resolved) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %file.display(), error = %err, "failed to delete transfer file"),
        }
    }
}

impl TransferRegistry {
    pub fn new(
        engine: Arc<dyn TransferEngine>,
        manifest_path: PathBuf,
        content_root: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        let (snapshots, _) = watch::channel(Vec::new());
        Self {
            engine,
            manifest_path,
            content_root,
            poll_interval,
            handles: Mutex::new(HashMap::new()),
            starting: StdMutex::new(HashMap::new()),
            snapshots,
            poller: StdMutex::new(None),
        }
    }

    /// Fresh read of the manifest; the index is never cached.
    pub fn index(&self) -> ContentIndex {
        ContentIndex::load(&self.manifest_path)
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn transfer_dir(&self, id: ContentId, version: &str) -> PathBuf {
        self.content_root.join(id.as_str()).join(version)
    }

    pub async fn contains(&self, hash: &InfoHash) -> bool {
        self.handles.lock().await.contains_key(hash)
    }

    pub(crate) async fn inspect(&self, descriptor: &[u8]) -> Result<InfoHash> {
        self.engine.inspect(descriptor).await
    }

    /// Starts (or resumes) the transfer for `info`. The version must be listed
    /// in the manifest.
    pub async fn start(&self, info: &VersionInfo) -> Result<TransferSnapshot> {
        let hash = info.info_hash()?;
        let resolved = self
            .index()
            .resolve_hash(&hash)
            .ok_or_else(|| DlcError::NotFound(format!("transfer {hash} is not in the content index")))?;

        let slot = {
            let handles = self.handles.lock().await;
            if handles.contains_key(&hash) {
                None
            } else {
                let mut starting = self.starting.lock().unwrap_or_else(|p| p.into_inner());
                Some(starting.entry(hash.clone()).or_default().clone())
            }
        };

        match slot {
            None => {
                debug!(info_hash = %hash, "transfer already registered, resuming");
                self.engine.resume(&hash).await?;
            }
            Some(slot) => {
                let added = slot
                    .get_or_try_init(|| {
                        self.add_transfer(info, &hash, resolved.content_id, &resolved.version)
                    })
                    .await
                    .map(|_| ());
                {
                    let mut starting = self.starting.lock().unwrap_or_else(|p| p.into_inner());
                    if starting.get(&hash).map_or(false, |s| Arc::ptr_eq(s, &slot)) {
                        starting.remove(&hash);
                    }
                }
                added?;
            }
        }

        let snapshots = self.refresh().await;
        snapshots
            .into_iter()
            .find(|s| s.info_hash == hash)
            .ok_or_else(|| DlcError::TransferRemoved(hash.to_string()))
    }

    async fn add_transfer(
        &self,
        info: &VersionInfo,
        hash: &InfoHash,
        content_id: ContentId,
        version: &str,
    ) -> Result<()> {
        let dir = self.transfer_dir(content_id, version);
        tokio::fs::create_dir_all(&dir).await.at(&dir)?;
        let added = self
            .engine
            .add(
                TransferSource::Magnet(info.magnet.clone()),
                AddOptions {
                    output_dir: dir.clone(),
                    paused: false,
                },
            )
            .await?;
        if &added != hash {
            if let Err(err) = self.engine.remove(&added).await {
                warn!(info_hash = %added, error = %err, "failed to drop mismatched transfer");
            }
            return Err(DlcError::Engine(format!(
                "engine registered {added} for magnet of {hash}"
            )));
        }
        info!(info_hash = %hash, content_id = %content_id, version, dir = %dir.display(), "transfer started");
        self.handles
            .lock()
            .await
            .insert(hash.clone(), Handle::new(content_id, version.to_string(), dir));
        Ok(())
    }

    async fn known(&self, id: &str) -> Result<Option<InfoHash>> {
        let hash = InfoHash::from_transfer_id(id)?;
        let known = self.handles.lock().await.contains_key(&hash);
        if !known {
            debug!(info_hash = %hash, "no transfer registered, ignoring");
        }
        Ok(known.then_some(hash))
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        if let Some(hash) = self.known(id).await? {
            self.engine.pause(&hash).await?;
            self.refresh().await;
        }
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        if let Some(hash) = self.known(id).await? {
            self.engine.resume(&hash).await?;
            self.refresh().await;
        }
        Ok(())
    }

    /// Drops the transfer and deletes its payload files. The descriptor stays
    /// so a later `start` can skip the metadata exchange. Only files that
    /// resolve inside the transfer's own directory are deleted.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let hash = InfoHash::from_transfer_id(id)?;
        {
            let mut handles = self.handles.lock().await;
            let Some(handle) = handles.remove(&hash) else {
                debug!(info_hash = %hash, "no transfer registered, ignoring");
                return Ok(());
            };
            let files = self.engine.files(&hash).await;
            self.engine.remove(&hash).await?;
            drop(handles);
            delete_confined(&handle.dir, files);
            info!(info_hash = %hash, "transfer removed");
        }
        self.refresh().await;
        Ok(())
    }

    /// Tears the transfer down so its file handles can be released. A teardown
    /// that outlives `timeout` is logged and abandoned.
    pub async fn destroy_for_install(&self, id: &str, timeout: Duration) -> Result<()> {
        let hash = InfoHash::from_transfer_id(id)?;
        {
            let mut handles = self.handles.lock().await;
            handles.remove(&hash);
            match tokio::time::timeout(timeout, self.engine.shutdown(&hash)).await {
                Ok(Ok(())) => info!(info_hash = %hash, "transfer torn down for install"),
                Ok(Err(err)) => warn!(info_hash = %hash, error = %err, "transfer teardown failed, proceeding"),
                Err(_) => warn!(info_hash = %hash, ?timeout, "transfer teardown timed out, proceeding"),
            }
        }
        self.refresh().await;
        Ok(())
    }

    pub(crate) async fn attach_descriptor(
        &self,
        bytes: Vec<u8>,
        hash: &InfoHash,
        content_id: ContentId,
        version: &str,
    ) -> Result<AttachOutcome> {
        let mut handles = self.handles.lock().await;
        if handles.contains_key(hash) {
            return Ok(AttachOutcome::AlreadyRegistered);
        }
        let dir = self.transfer_dir(content_id, version);
        let added = self
            .engine
            .add(
                TransferSource::Descriptor(bytes),
                AddOptions {
                    output_dir: dir.clone(),
                    paused: true,
                },
            )
            .await?;
        if &added != hash {
            self.engine.remove(&added).await?;
            return Err(DlcError::Engine(format!("descriptor for {hash} attached as {added}")));
        }

        let mut handle = Handle::new(content_id, version.to_string(), dir);
        handle.descriptor_saved = true;
        let finished = self
            .engine
            .stats(hash)
            .await
            .map(|s| s.finished)
            .unwrap_or(false);
        if finished {
            self.engine.seed_only(hash).await?;
            handle.seeding = true;
        }
        handles.insert(hash.clone(), handle);
        drop(handles);
        self.refresh().await;
        Ok(AttachOutcome::Attached { seeding: finished })
    }

    /// Polls the engine once, persists newly available descriptors and
    /// publishes the snapshot list to subscribers.
    pub async fn refresh(&self) -> Vec<TransferSnapshot> {
        let mut handles = self.handles.lock().await;
        let now = Instant::now();
        let mut out = Vec::with_capacity(handles.len());
        let mut unsaved = Vec::new();

        for (hash, handle) in handles.iter_mut() {
            let Some(stats) = self.engine.stats(hash).await else {
                continue;
            };

            let elapsed = now.saturating_duration_since(handle.last_poll);
            if elapsed >= Duration::from_millis(50) {
                handle.download_speed =
                    rate(stats.progress_bytes.saturating_sub(handle.last_bytes), elapsed);
                handle.upload_speed =
                    rate(stats.uploaded_bytes.saturating_sub(handle.last_uploaded), elapsed);
                handle.last_bytes = stats.progress_bytes;
                handle.last_uploaded = stats.uploaded_bytes;
                handle.last_poll = now;
            }

            if !handle.descriptor_saved && stats.has_metadata {
                if let Some(bytes) = self.engine.descriptor(hash).await {
                    unsaved.push((hash.clone(), handle.dir.clone(), bytes));
                }
            }

            let progress = if stats.total_bytes > 0 {
                stats.progress_bytes as f64 / stats.total_bytes as f64
            } else if stats.finished {
                1.0
            } else {
                0.0
            };
            out.push(TransferSnapshot {
                info_hash: hash.clone(),
                content_id: handle.content_id,
                version: handle.version.clone(),
                name: stats.name,
                progress,
                downloaded_bytes: stats.progress_bytes,
                total_bytes: stats.total_bytes,
                download_speed: handle.download_speed,
                upload_speed: handle.upload_speed,
                paused: stats.paused,
                done: stats.finished,
                seeding: handle.seeding,
            });
        }
        drop(handles);
        if !unsaved.is_empty() {
            self.persist_descriptors(unsaved).await;
        }

        out.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        self.snapshots.send_replace(out.clone());
        out
    }

    async fn persist_descriptors(&self, unsaved: Vec<(InfoHash, PathBuf, Vec<u8>)>) {
        let mut saved = Vec::with_capacity(unsaved.len());
        for (hash, dir, bytes) in unsaved {
            let key = hash.clone();
            let written =
                tokio::task::spawn_blocking(move || persistence::save_descriptor(&dir, &key, &bytes)).await;
            match written {
                Ok(Ok(SaveOutcome::Written)) => {
                    info!(info_hash = %hash, "metadata received, descriptor persisted");
                    saved.push(hash);
                }
                Ok(Ok(SaveOutcome::AlreadyPresent)) => saved.push(hash),
                Ok(Err(err)) => warn!(info_hash = %hash, error = %err, "failed to persist descriptor"),
                Err(err) => warn!(info_hash = %hash, error = %err, "descriptor writer panicked"),
            }
        }
        if saved.is_empty() {
            return;
        }
        let mut handles = self.handles.lock().await;
        for hash in saved {
            if let Some(handle) = handles.get_mut(&hash) {
                handle.descriptor_saved = true;
            }
        }
    }

    pub async fn query_all(&self) -> Vec<TransferSnapshot> {
        self.refresh().await
    }

    pub fn snapshot(&self, id: &str) -> Option<TransferSnapshot> {
        let hash = InfoHash::from_transfer_id(id).ok()?;
        self.snapshots
            .borrow()
            .iter()
            .find(|s| s.info_hash == hash)
            .cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TransferSnapshot>> {
        self.snapshots.subscribe()
    }

    pub async fn index_with_progress(&self) -> Vec<IndexedContent> {
        let live = self.refresh().await;
        self.index()
            .entries()
            .iter()
            .map(|entry| {
                let progress = entry
                    .versions
                    .iter()
                    .map(|(version, info)| {
                        let snap = info
                            .info_hash()
                            .ok()
                            .and_then(|h| live.iter().find(|s| s.info_hash == h).cloned());
                        (version.clone(), snap)
                    })
                    .collect();
                IndexedContent {
                    entry: entry.clone(),
                    progress,
                }
            })
            .collect()
    }

    /// Starts the recurring poll task if it is not running. The task stops on
    /// its own once the registry is dropped.
    pub fn spawn_progress_loop(self: &Arc<Self>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if poller.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.poll_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.refresh().await;
            }
        }));
    }

    /// Waits until the transfer reports done, feeding every observed snapshot
    /// to `on_progress`. Fails with `DownloadTimeout` past `ceiling` and with
    /// `TransferRemoved` if the transfer disappears.
    pub async fn wait_until_done(
        self: &Arc<Self>,
        hash: &InfoHash,
        ceiling: Duration,
        mut on_progress: impl FnMut(&TransferSnapshot),
    ) -> Result<TransferSnapshot> {
        self.spawn_progress_loop();
        let mut rx = self.subscribe();
        self.refresh().await;

        let started = Instant::now();
        let deadline = started + ceiling;
        let mut polls = 0u64;
        loop {
            let current = rx
                .borrow_and_update()
                .iter()
                .find(|s| &s.info_hash == hash)
                .cloned();
            let snap = match current {
                None => return Err(DlcError::TransferRemoved(hash.to_string())),
                Some(snap) if snap.done => {
                    on_progress(&snap);
                    return Ok(snap);
                }
                Some(snap) => snap,
            };
            polls += 1;
            if polls % 10 == 0 {
                info!(info_hash = %hash, percent = snap.percent(), speed = snap.download_speed, "download progress");
            }
            on_progress(&snap);

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(DlcError::Engine("progress channel closed".into())),
                Err(_) => {
                    warn!(info_hash = %hash, percent = snap.percent(), "download ceiling reached");
                    return Err(DlcError::DownloadTimeout {
                        info_hash: hash.to_string(),
                        percent: snap.percent(),
                        downloaded_bytes: snap.downloaded_bytes,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackEngine, LoopbackFile};
    use crate::index::tests::magnet;
    use dlc_protocol::ContentEntry;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Arc<LoopbackEngine>,
        registry: Arc<TransferRegistry>,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dlc");
        std::fs::create_dir_all(&root).unwrap();
        let entries = vec![ContentEntry {
            id: ContentId::TrainingTar,
            name: "Training".into(),
            versions: [
                ("1.0.0".to_string(), VersionInfo::new(magnet('a'))),
                ("1.1.0".to_string(), VersionInfo::new(magnet('b'))),
            ]
            .into_iter()
            .collect(),
        }];
        let manifest = root.join("dlc-index.json");
        std::fs::write(&manifest, serde_json::to_vec(&entries).unwrap()).unwrap();

        let engine = Arc::new(LoopbackEngine::new());
        let registry = Arc::new(TransferRegistry::new(
            engine.clone(),
            manifest,
            root.clone(),
            Duration::from_millis(100),
        ));
        Fixture {
            _dir: dir,
            engine,
            registry,
            root,
        }
    }

    fn hash(c: char) -> InfoHash {
        InfoHash::parse(&c.to_string().repeat(40)).unwrap()
    }

    #[tokio::test]
    async fn concurrent_start_yields_one_transfer() {
        let fx = fixture();
        let info = VersionInfo::new(magnet('a'));
        let (a, b) = tokio::join!(fx.registry.start(&info), fx.registry.start(&info));
        assert_eq!(a.unwrap().info_hash, b.unwrap().info_hash);
        assert_eq!(fx.engine.add_count(), 1);
        assert_eq!(fx.registry.query_all().await.len(), 1);
        assert!(fx.root.join("TRAINING_TAR").join("1.0.0").is_dir());
    }

    #[tokio::test]
    async fn start_rejects_unlisted_magnet() {
        let fx = fixture();
        let err = fx.registry.start(&VersionInfo::new(magnet('f'))).await.unwrap_err();
        assert!(matches!(err, DlcError::NotFound(_)));
        assert_eq!(fx.engine.add_count(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_noops() {
        let fx = fixture();
        let id = "c".repeat(40);
        fx.registry.pause(&id).await.unwrap();
        fx.registry.resume(&id).await.unwrap();
        fx.registry.remove(&id).await.unwrap();
        assert!(fx.registry.query_all().await.is_empty());
        assert!(matches!(
            fx.registry.pause("nonsense").await,
            Err(DlcError::InvalidTransferId(_))
        ));
    }

    #[tokio::test]
    async fn metadata_persists_descriptor_and_remove_keeps_it() {
        let fx = fixture();
        let h = hash('b');
        fx.engine.publish(
            h.clone(),
            "training",
            vec![LoopbackFile::new("training.tar", vec![1u8; 32])],
        );
        let snap = fx.registry.start(&VersionInfo::new(magnet('b'))).await.unwrap();
        assert!(snap.done);
        assert_eq!(snap.percent(), 100);

        let dir = fx.root.join("TRAINING_TAR").join("1.1.0");
        let descriptor = dir.join(format!("{h}.descriptor"));
        assert!(descriptor.is_file());
        assert!(dir.join("training.tar").is_file());

        fx.registry.remove(h.as_str()).await.unwrap();
        assert!(!dir.join("training.tar").exists());
        assert!(descriptor.is_file());
        assert_eq!(fx.engine.transfer_count(), 0);
    }

    #[tokio::test]
    async fn pause_and_resume_are_reflected_in_snapshots() {
        let fx = fixture();
        fx.registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        fx.registry.pause(&magnet('a')).await.unwrap();
        assert!(fx.registry.snapshot(&magnet('a')).unwrap().paused);
        fx.registry.resume(&magnet('a')).await.unwrap();
        assert!(!fx.registry.snapshot(&magnet('a')).unwrap().paused);
    }

    #[tokio::test]
    async fn index_with_progress_marks_live_versions() {
        let fx = fixture();
        fx.registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        let view = fx.registry.index_with_progress().await;
        assert_eq!(view.len(), 1);
        assert!(view[0].progress["1.0.0"].is_some());
        assert!(view[0].progress["1.1.0"].is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_on_stalled_transfer() {
        let fx = fixture();
        let snap = fx.registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        let mut seen = 0;
        let err = fx
            .registry
            .wait_until_done(&snap.info_hash, Duration::from_secs(5), |_| seen += 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DlcError::DownloadTimeout { percent: 0, .. }));
        assert!(seen >= 1);
    }

    #[tokio::test]
    async fn wait_reports_removed_transfer() {
        let fx = fixture();
        let snap = fx.registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        fx.registry.remove(snap.info_hash.as_str()).await.unwrap();
        let err = fx
            .registry
            .wait_until_done(&snap.info_hash, Duration::from_secs(5), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DlcError::TransferRemoved(_)));
    }

    #[tokio::test]
    async fn destroy_for_install_drops_handle() {
        let fx = fixture();
        let snap = fx.registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        fx.registry
            .destroy_for_install(snap.info_hash.as_str(), Duration::from_secs(3))
            .await
            .unwrap();
        assert!(!fx.registry.contains(&snap.info_hash).await);
        assert!(fx.registry.query_all().await.is_empty());
    }

    /// Loopback engine with a slow `add` and optional extra file paths, to
    /// exercise the registry against a misbehaving backend.
    struct Wrapped {
        inner: Arc<LoopbackEngine>,
        add_delay: Duration,
        extra_files: Vec<PathBuf>,
    }

    #[async_trait::async_trait]
    impl TransferEngine for Wrapped {
        async fn add(&self, source: TransferSource, opts: AddOptions) -> Result<InfoHash> {
            tokio::time::sleep(self.add_delay).await;
            self.inner.add(source, opts).await
        }
        async fn inspect(&self, descriptor: &[u8]) -> Result<InfoHash> {
            self.inner.inspect(descriptor).await
        }
        async fn pause(&self, hash: &InfoHash) -> Result<()> {
            self.inner.pause(hash).await
        }
        async fn resume(&self, hash: &InfoHash) -> Result<()> {
            self.inner.resume(hash).await
        }
        async fn remove(&self, hash: &InfoHash) -> Result<()> {
            self.inner.remove(hash).await
        }
        async fn seed_only(&self, hash: &InfoHash) -> Result<()> {
            self.inner.seed_only(hash).await
        }
        async fn shutdown(&self, hash: &InfoHash) -> Result<()> {
            self.inner.shutdown(hash).await
        }
        async fn stats(&self, hash: &InfoHash) -> Option<crate::engine::EngineStats> {
            self.inner.stats(hash).await
        }
        async fn descriptor(&self, hash: &InfoHash) -> Option<Vec<u8>> {
            self.inner.descriptor(hash).await
        }
        async fn files(&self, hash: &InfoHash) -> Vec<PathBuf> {
            let mut files = self.inner.files(hash).await;
            files.extend(self.extra_files.iter().cloned());
            files
        }
    }

    fn wrapped(fx: &Fixture, add_delay: Duration, extra_files: Vec<PathBuf>) -> Arc<TransferRegistry> {
        let engine = Arc::new(Wrapped {
            inner: fx.engine.clone(),
            add_delay,
            extra_files,
        });
        Arc::new(TransferRegistry::new(
            engine,
            fx.root.join("dlc-index.json"),
            fx.root.clone(),
            Duration::from_millis(100),
        ))
    }

    #[tokio::test]
    async fn remove_only_deletes_inside_transfer_dir() {
        let fx = fixture();
        let outside = fx._dir.path().join("victim.txt");
        std::fs::write(&outside, b"precious").unwrap();
        let sibling = fx.root.join("TRAINING_TAR").join("1.1.0").join("other.bin");
        std::fs::create_dir_all(sibling.parent().unwrap()).unwrap();
        std::fs::write(&sibling, b"other version").unwrap();

        let dir = fx.root.join("TRAINING_TAR").join("1.0.0");
        let registry = wrapped(
            &fx,
            Duration::ZERO,
            vec![
                dir.join("..").join("..").join("..").join("victim.txt"),
                dir.join("..").join("1.1.0").join("other.bin"),
                outside.clone(),
            ],
        );
        fx.engine.publish(
            hash('a'),
            "training",
            vec![LoopbackFile::new("training.tar", vec![3u8; 8])],
        );
        registry.start(&VersionInfo::new(magnet('a'))).await.unwrap();
        assert!(dir.join("training.tar").is_file());

        registry.remove(&magnet('a')).await.unwrap();
        assert!(!dir.join("training.tar").exists());
        assert_eq!(std::fs::read(&outside).unwrap(), b"precious");
        assert_eq!(std::fs::read(&sibling).unwrap(), b"other version");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_add_does_not_block_other_callers() {
        let fx = fixture();
        fx.engine.publish(
            hash('a'),
            "training",
            vec![LoopbackFile::new("training.tar", vec![1u8; 8])],
        );
        let registry = wrapped(&fx, Duration::from_secs(5), Vec::new());
        let info = VersionInfo::new(magnet('a'));

        let first = tokio::spawn({
            let registry = registry.clone();
            let info = info.clone();
            async move { registry.start(&info).await }
        });
        while fx.root.join("TRAINING_TAR").join("1.0.0").metadata().is_err()
            || registry.starting.lock().unwrap().is_empty()
        {
            tokio::task::yield_now().await;
        }

        let listed = tokio::time::timeout(Duration::from_secs(1), registry.query_all())
            .await
            .expect("query_all must not wait for the engine");
        assert!(listed.is_empty());
        tokio::time::timeout(Duration::from_secs(1), registry.pause(&magnet('a')))
            .await
            .expect("pause must not wait for the engine")
            .unwrap();

        let second = registry.start(&info).await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(fx.engine.add_count(), 1);
        assert!(registry.starting.lock().unwrap().is_empty());
        assert_eq!(registry.query_all().await.len(), 1);
    }
}
