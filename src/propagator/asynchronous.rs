//! Asynchronous propagation.
//!
//! `propagate` only appends a change record to the on-disk queue of the
//! first ancestor and returns. The first writer to create a node's change
//! directory schedules a deferred worker; the worker renames the directory
//! to `.processing` (the single commit point), aggregates every record,
//! applies the combined update under the ancestor's lock, and recurses
//! towards the root. The on-disk queue doubles as a crash-safe journal: a
//! janitor resumes `.processing` directories that outlived the grace
//! period, which is also the recovery path after a restart.

use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::layout;
use crate::lookup::Lookup;
use crate::node::{MetaNode, Node, NodeId, SpaceId};
use crate::propagator::{apply_rollup, Propagator};
use crate::utils::{format_timestamp, parse_timestamp};

#[derive(Debug, Deserialize, Serialize)]
struct ChangeRecord {
    sync_time: String,
    size_diff: i64,
}

struct Inner {
    lookup: Arc<Lookup>,
    /// Change directories a worker of this process is already responsible
    /// for; keyed without the `.processing` suffix.
    inflight: Mutex<HashSet<PathBuf>>,
}

#[derive(Clone)]
pub struct AsyncPropagator {
    inner: Arc<Inner>,
}

impl AsyncPropagator {
    pub fn new(lookup: Arc<Lookup>) -> Self {
        Self {
            inner: Arc::new(Inner {
                lookup,
                inflight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Starts the background janitor. It scans immediately (crash
    /// recovery), then on every interval until `shutdown` flips.
    pub fn start_janitor(&self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let propagator = self.clone();
        let interval = propagator.inner.lookup.config().janitor_interval();

        tokio::spawn(async move {
            loop {
                if let Err(err) = propagator.janitor_scan().await {
                    warn!(error = %err, "janitor scan failed");
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("janitor stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn mark_inflight(&self, dir: &Path) -> bool {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dir.to_path_buf())
    }

    fn clear_inflight(&self, dir: &Path) {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(dir);
    }

    /// Appends one change record for the first ancestor of `node` and
    /// schedules the deferred worker when this call created the queue
    /// directory.
    async fn enqueue(
        &self,
        node: &Node,
        sync_time: OffsetDateTime,
        size_diff: i64,
    ) -> FsResult<()> {
        let Some(parent_id) = node.parent_id().cloned() else {
            return Ok(());
        };

        let dir = layout::change_node_dir(
            node.space_root(),
            node.space_id().as_str(),
            parent_id.as_str(),
        );
        let record = ChangeRecord {
            sync_time: format_timestamp(sync_time),
            size_diff,
        };
        let payload = rmp_serde::to_vec(&record).map_err(|_| FsError::Corruption {
            path: dir.clone(),
            detail: "change record failed to encode",
        })?;

        // The queue directory may be renamed away by a worker between our
        // existence check and the write; retry with a fresh directory.
        for _attempt in 0..3 {
            if let Some(parent) = dir.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let created = match std::fs::create_dir(&dir) {
                Ok(()) => true,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => false,
                Err(err) => return Err(err.into()),
            };

            let mut staged = match tempfile::NamedTempFile::new_in(&dir) {
                Ok(staged) => staged,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            staged.write_all(&payload)?;

            let target = dir.join(format!("{}.mpk", Uuid::new_v4()));
            match staged.persist(&target) {
                Ok(_) => {
                    if created {
                        self.schedule(dir);
                    }
                    return Ok(());
                }
                Err(persist)
                    if persist.error.kind() == std::io::ErrorKind::NotFound =>
                {
                    continue;
                }
                Err(persist) => return Err(FsError::Io(persist.error)),
            }
        }

        Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "change queue kept vanishing while appending",
        )))
    }

    fn schedule(&self, dir: PathBuf) {
        if !self.mark_inflight(&dir) {
            return;
        }

        let propagator = self.clone();
        let delay = propagator.inner.lookup.config().propagation_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = propagator.process_change_dir(&dir).await {
                warn!(dir = %dir.display(), error = %err, "deferred propagation failed");
            }
            propagator.clear_inflight(&dir);
        });
    }

    fn processing_path(dir: &Path) -> PathBuf {
        let mut name = dir
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(layout::PROCESSING_SUFFIX);
        dir.with_file_name(name)
    }

    /// Commits the queue by renaming it aside, then drains it.
    async fn process_change_dir(&self, dir: &Path) -> FsResult<()> {
        let processing = Self::processing_path(dir);
        match std::fs::rename(dir, &processing) {
            Ok(()) => {}
            // Another worker (or the janitor of another process) already
            // took the batch.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        self.drain_processing_dir(&processing).await
    }

    /// Aggregates and applies a committed `.processing` directory, then
    /// recurses towards the space root.
    async fn drain_processing_dir(&self, processing: &Path) -> FsResult<()> {
        let mut size_diff = 0i64;
        let mut sync_time: Option<OffsetDateTime> = None;
        let mut records = 0usize;

        for entry in std::fs::read_dir(processing)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mpk") {
                continue;
            }

            let payload = std::fs::read(&path)?;
            let record: ChangeRecord = match rmp_serde::from_slice(&payload) {
                Ok(record) => record,
                Err(_) => {
                    warn!(record = %path.display(), "skipping unparseable change record");
                    continue;
                }
            };

            records += 1;
            size_diff += record.size_diff;
            if let Ok(parsed) = parse_timestamp(&record.sync_time) {
                sync_time = Some(match sync_time {
                    Some(known) if known >= parsed => known,
                    _ => parsed,
                });
            }
        }

        let outcome = self.apply_batch(processing, records, size_diff, sync_time).await;

        if let Err(err) = std::fs::remove_dir_all(processing) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %processing.display(), error = %err, "change queue cleanup failed");
            }
        }

        outcome
    }

    async fn apply_batch(
        &self,
        processing: &Path,
        records: usize,
        size_diff: i64,
        sync_time: Option<OffsetDateTime>,
    ) -> FsResult<()> {
        if records == 0 {
            return Ok(());
        }

        let Some((space_id, node_id)) = Self::identity_from_dir(processing) else {
            warn!(dir = %processing.display(), "change queue directory name is not an identity");
            return Ok(());
        };

        let node = match self
            .inner
            .lookup
            .node_from_id(&space_id, &node_id)
            .await
        {
            Ok(node) => node,
            Err(err) if err.is_not_found() => {
                trace!(%space_id, %node_id, "node vanished before deferred propagation");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let sync_time = sync_time.unwrap_or_else(OffsetDateTime::now_utc);
        let keep_walking = apply_rollup(&self.inner.lookup, &node, sync_time, size_diff).await?;

        if keep_walking && !node.is_space_root() {
            self.enqueue(&node, sync_time, size_diff).await?;
        }

        Ok(())
    }

    fn identity_from_dir(processing: &Path) -> Option<(SpaceId, NodeId)> {
        let name = processing.file_name()?.to_str()?;
        let name = name
            .strip_suffix(layout::PROCESSING_SUFFIX)
            .unwrap_or(name);
        let (space, node) = name.split_once(':')?;
        Some((SpaceId::from(space), NodeId::from(node)))
    }

    /// Scans every space for abandoned queue directories: `.processing`
    /// ones older than the grace period and plain ones whose worker never
    /// ran (a previous process died before its timer fired).
    async fn janitor_scan(&self) -> FsResult<()> {
        let config = self.inner.lookup.config();
        let grace = config.janitor_grace();
        let stale_plain = config.propagation_delay() + grace;

        for area in ["users", "projects"] {
            let area_dir = config.root.join(area);
            let Ok(spaces) = std::fs::read_dir(&area_dir) else {
                continue;
            };

            for space in spaces.flatten() {
                let changes = layout::changes_dir(&space.path());
                let Ok(shards) = std::fs::read_dir(&changes) else {
                    continue;
                };

                for shard in shards.flatten() {
                    let Ok(queues) = std::fs::read_dir(shard.path()) else {
                        continue;
                    };

                    for queue in queues.flatten() {
                        let path = queue.path();
                        let Ok(meta) = queue.metadata() else { continue };
                        let age = meta
                            .modified()
                            .ok()
                            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
                            .unwrap_or_default();

                        let is_processing = path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.ends_with(layout::PROCESSING_SUFFIX))
                            .unwrap_or(false);

                        if is_processing && age >= grace && self.mark_inflight(&path) {
                            debug!(dir = %path.display(), "janitor resuming abandoned batch");
                            let propagator = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = propagator.drain_processing_dir(&path).await {
                                    warn!(dir = %path.display(), error = %err, "janitor drain failed");
                                }
                                propagator.clear_inflight(&path);
                            });
                        } else if !is_processing && age >= stale_plain && self.mark_inflight(&path)
                        {
                            debug!(dir = %path.display(), "janitor adopting orphaned queue");
                            let propagator = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = propagator.process_change_dir(&path).await {
                                    warn!(dir = %path.display(), error = %err, "janitor processing failed");
                                }
                                propagator.clear_inflight(&path);
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Propagator for AsyncPropagator {
    async fn propagate(
        &self,
        node: &Node,
        sync_time: OffsetDateTime,
        size_diff: i64,
    ) -> FsResult<()> {
        let config = self.inner.lookup.config();
        if !config.tree_time_accounting && (!config.tree_size_accounting || size_diff == 0) {
            return Ok(());
        }

        self.enqueue(node, sync_time, size_diff).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::config::EngineConfig;
    use crate::idcache::IdCache;
    use crate::metadata::{attr_u64, attribute, MetadataBackend, LockManager, XattrsBackend};
    use crate::propagator::test_support::{seed_container, seed_file, tree_size_of};

    async fn fixture(propagation_delay_ms: u64) -> (tempfile::TempDir, Arc<Lookup>, SpaceId) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_root(dir.path());
        config.propagation_delay_ms = propagation_delay_ms;
        let config = Arc::new(config);

        let locks = Arc::new(LockManager::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(XattrsBackend::new(locks));
        let id_cache = Arc::new(
            IdCache::open(&config.id_cache_path(), Duration::from_secs(60)).unwrap(),
        );
        let lookup = Arc::new(Lookup::new(config, metadata, id_cache));

        let space_id = SpaceId::from("space-root-1");
        let root = dir.path().join("users/marie");
        seed_container(&lookup, &space_id, &root, &root, space_id.as_str(), None).await;

        (dir, lookup, space_id)
    }

    #[tokio::test]
    async fn deferred_worker_aggregates_records_and_recurses() {
        let (dir, lookup, space_id) = fixture(50).await;
        let root = dir.path().join("users/marie");

        seed_container(&lookup, &space_id, &root, &root.join("d"), "dir-1", Some(space_id.as_str())).await;
        seed_file(&lookup, &space_id, &root, &root.join("d/f.txt"), "file-1", "dir-1", 11).await;
        seed_file(&lookup, &space_id, &root, &root.join("d/g.txt"), "file-2", "dir-1", 11).await;

        let propagator = AsyncPropagator::new(lookup.clone());
        let now = OffsetDateTime::now_utc();

        for id in ["file-1", "file-2"] {
            let node = lookup
                .node_from_id(&space_id, &NodeId::from(id))
                .await
                .unwrap();
            propagator.propagate(&node, now, 11).await.unwrap();
        }

        // Both records landed in one queue directory for dir-1.
        let queue = layout::change_node_dir(&root, space_id.as_str(), "dir-1");
        assert!(queue.exists());
        assert_eq!(
            std::fs::read_dir(&queue)
                .unwrap()
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "mpk"))
                .count(),
            2
        );

        // Wait out the deferral, the batch for dir-1 and the recursive one
        // for the space root.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let metadata = lookup.metadata();
        assert_eq!(
            tree_size_of(metadata, &root, &root.join("d")).await,
            Some(22)
        );
        assert_eq!(tree_size_of(metadata, &root, &root).await, Some(22));
        assert!(!queue.exists());
    }

    #[tokio::test]
    async fn janitor_resumes_abandoned_processing_dirs() {
        let (dir, lookup, space_id) = fixture(10).await;
        let root = dir.path().join("users/marie");

        seed_container(&lookup, &space_id, &root, &root.join("d"), "dir-1", Some(space_id.as_str())).await;

        // Fake a crashed worker: a committed batch nobody drained.
        let queue = layout::change_node_dir(&root, space_id.as_str(), "dir-1");
        let processing = AsyncPropagator::processing_path(&queue);
        std::fs::create_dir_all(&processing).unwrap();
        let record = ChangeRecord {
            sync_time: format_timestamp(OffsetDateTime::now_utc()),
            size_diff: 7,
        };
        std::fs::write(
            processing.join(format!("{}.mpk", Uuid::new_v4())),
            rmp_serde::to_vec(&record).unwrap(),
        )
        .unwrap();

        let mut config = EngineConfig::with_root(dir.path());
        config.propagation_delay_ms = 10;
        config.janitor_grace_ms = 0;
        config.janitor_interval_ms = 20;
        let lookup = Arc::new(Lookup::new(
            Arc::new(config),
            lookup.metadata().clone(),
            lookup.id_cache().clone(),
        ));

        let propagator = AsyncPropagator::new(lookup.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let janitor = propagator.start_janitor(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(true).ok();
        janitor.abort();

        assert!(!processing.exists());
        let attrs = lookup
            .metadata()
            .get_all_at(&root, &root.join("d"))
            .await
            .unwrap();
        assert_eq!(attr_u64(&attrs, attribute::TREE_SIZE), Some(7));
    }
}
