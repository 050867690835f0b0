//! # Assimilation
//!
//! Adopts externally created or modified filesystem entries into the
//! id-stable logical tree. Watcher actions land in the [`Debouncer`]; a
//! bounded worker pool drains the debounced queue and reconciles each path
//! against the metadata backend and the id cache: confirming self-induced
//! events, tracking moves, resolving id clashes by re-identification, and
//! assigning fresh identities (with content checksums) to unknown entries.
//! Every pass ends by re-propagating so tree roll-ups stay consistent.

mod debouncer;
mod warmup;

pub use debouncer::{Debouncer, ScanItem};

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, trace, warn};

use crate::blobstore::{BlobRef, Blobstore};
use crate::error::{FsError, FsResult};
use crate::events::{Event, EventSink};
use crate::lookup::Lookup;
use crate::metadata::{
    attr_str, attr_u64, attribute, sibling_lockfile, Attributes, LockManager,
};
use crate::metrics::{self, Metrics};
use crate::node::{MetaNode, Node, NodeId, RawNode, ResourceId, SpaceId};
use crate::propagator::Propagator;
use crate::users::UserMapper;
use crate::utils::{checksum_file, disk_mtime, format_timestamp};
use crate::watcher::{space_root_of, Action, ActionKind};

const MAX_ASSIMILATION_DEPTH: usize = 255;

struct Inner {
    lookup: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
    propagator: Arc<dyn Propagator>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    users: Arc<dyn UserMapper>,
    locks: Arc<LockManager>,
    debouncer: Debouncer,
}

#[derive(Clone)]
pub struct Assimilator {
    inner: Arc<Inner>,
}

impl Assimilator {
    /// Builds the assimilator and the receiving end of its debounced work
    /// queue; pass the receiver to [`Assimilator::spawn_workers`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lookup: Arc<Lookup>,
        blobstore: Arc<dyn Blobstore>,
        propagator: Arc<dyn Propagator>,
        events: Arc<dyn EventSink>,
        metrics: Arc<Metrics>,
        users: Arc<dyn UserMapper>,
        locks: Arc<LockManager>,
    ) -> (Self, mpsc::Receiver<ScanItem>) {
        let (tx, rx) = mpsc::channel(1024);
        let debouncer = Debouncer::new(lookup.config().debounce_delay(), tx);

        let assimilator = Self {
            inner: Arc::new(Inner {
                lookup,
                blobstore,
                propagator,
                events,
                metrics,
                users,
                locks,
                debouncer,
            }),
        };
        (assimilator, rx)
    }

    /// Starts `max_concurrency` workers draining the debounced queue until
    /// the channel closes or `shutdown` flips.
    pub fn spawn_workers(
        &self,
        rx: mpsc::Receiver<ScanItem>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.inner.lookup.config().max_concurrency.max(1);

        (0..workers)
            .map(|worker| {
                let assimilator = self.clone();
                let rx = rx.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let item = tokio::select! {
                            item = async { rx.lock().await.recv().await } => item,
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return;
                                }
                                continue;
                            }
                        };

                        let Some(item) = item else { return };
                        trace!(worker, path = %item.path.display(), "worker picked item");
                        assimilator.process(item).await;
                    }
                })
            })
            .collect()
    }

    /// Entry point for watcher actions.
    pub async fn dispatch(&self, action: Action) {
        match action.kind {
            ActionKind::Create | ActionKind::Update | ActionKind::Move | ActionKind::Delete => {
                self.inner
                    .debouncer
                    .enqueue(action.path, false, action.is_dir);
            }
            ActionKind::MoveFrom => self.note_move_out(&action.path).await,
        }
    }

    /// Direct enqueue, used by the tree after operations that warrant a
    /// rescan (restores, uploads finishing out of band).
    pub fn enqueue_scan(&self, path: impl Into<PathBuf>, recurse: bool) {
        self.inner.debouncer.enqueue(path, recurse, false);
    }

    /// Remembers the identity leaving `path` so a prompt move-in can
    /// recover it, and retires the now stale reverse index entry.
    async fn note_move_out(&self, path: &Path) {
        let id_cache = self.inner.lookup.id_cache();
        match id_cache.get_by_path(path).await {
            Ok(Some((space_id, node_id))) => {
                id_cache.history_store(path, space_id, node_id);
                if let Err(err) = id_cache.delete_path(path).await {
                    warn!(path = %path.display(), error = %err, "stale reverse entry survived move-out");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(path = %path.display(), error = %err, "move-out lookup failed"),
        }
    }

    async fn process(&self, item: ScanItem) {
        self.inner.metrics.task_started();

        let outcome = if item.path.exists() {
            self.assimilate_item(&item).await
        } else {
            self.handle_file_delete(&item.path, item.is_dir_hint).await
        };

        if let Err(err) = outcome {
            // Logged and dropped; the next event or warm-up re-enqueues.
            warn!(path = %item.path.display(), error = %err, "assimilation pass failed");
        }

        self.inner.debouncer.finished(&item.path);
        self.inner.metrics.task_finished();
    }

    #[instrument(level = tracing::Level::DEBUG, skip(self, item), fields(path = %item.path.display()))]
    async fn assimilate_item(&self, item: &ScanItem) -> FsResult<()> {
        let lookup = &self.inner.lookup;
        let path = &item.path;

        let Some(space_root) = lookup.find_space_root(path).await? else {
            debug!("no owning space, dropping");
            return Ok(());
        };
        let space_id = lookup.space_id_of_root(&space_root).await?;

        let _scope = if lookup.config().use_space_groups {
            let gid = std::fs::metadata(&space_root)?.gid();
            Some(self.inner.users.scope_to_group(gid)?)
        } else {
            None
        };

        let identity = match lookup.metadata().identify_path(&space_root, path).await {
            Ok(identity) => identity,
            Err(err) if err.is_not_found() => {
                return self.handle_file_delete(path, item.is_dir_hint).await
            }
            Err(err) => return Err(err),
        };

        match identity.id {
            Some(id) => {
                self.assimilate_known(&space_id, &space_root, path, id, identity.mtime)
                    .await
            }
            None => {
                self.assimilate_new(&space_id, &space_root, path, true, 0)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// The known-id branch: self-induced event, id clash, move, or cache
    /// refresh.
    async fn assimilate_known(
        &self,
        space_id: &SpaceId,
        space_root: &Path,
        path: &Path,
        id: NodeId,
        stored_mtime: Option<OffsetDateTime>,
    ) -> FsResult<()> {
        let inner = &self.inner;
        let metadata = inner.lookup.metadata();

        let raw = RawNode::new(space_id.clone(), space_root, path).with_id(id.clone());
        let _lock = inner.locks.lock(&metadata.lockfile_path(&raw)).await?;

        let prev_path = inner.lookup.id_cache().get(space_id, &id).await?;
        let on_disk_mtime = disk_mtime(path)?;
        let is_dir = path.is_dir();

        match prev_path {
            Some(prev) if prev == path => {
                if stored_mtime == Some(on_disk_mtime) {
                    trace!(%id, "event was self-induced");
                    return Ok(());
                }

                // Out-of-band content change at the known location.
                self.refresh_content(&raw, path, is_dir).await?;
                inner
                    .metrics
                    .count_assimilation(item_type(is_dir), metrics::ACTION_UPDATED);
                Ok(())
            }
            Some(prev) if prev.exists() => {
                // A copy that preserved the extended attributes: two live
                // paths claim the same id. The new path loses its metadata
                // and is re-assimilated for a fresh identity.
                debug!(%id, prev = %prev.display(), "id clash, scheduling re-identification");
                metadata.purge(&raw).await?;
                inner.debouncer.enqueue(path, false, is_dir);
                Ok(())
            }
            Some(prev) => {
                self.assimilate_move(&raw, &prev, path, is_dir).await
            }
            None => {
                // The index lost track of a node whose metadata survived.
                inner.lookup.id_cache().set(space_id, &id, path).await?;
                self.refresh_placement(&raw, path).await?;
                inner
                    .metrics
                    .count_assimilation(item_type(is_dir), metrics::ACTION_UPDATED);
                self.propagate_from_attrs(&raw, on_disk_mtime, 0).await;
                Ok(())
            }
        }
    }

    async fn assimilate_move(
        &self,
        raw: &RawNode,
        prev: &Path,
        path: &Path,
        is_dir: bool,
    ) -> FsResult<()> {
        let inner = &self.inner;
        let metadata = inner.lookup.metadata();
        let id_cache = inner.lookup.id_cache();

        let attrs = metadata.get_all(raw).await?;
        let old_parent_id = attr_str(&attrs, attribute::PARENT_ID).map(NodeId::from);
        let moved_size = if is_dir {
            attr_u64(&attrs, attribute::TREE_SIZE).unwrap_or(0)
        } else {
            attr_u64(&attrs, attribute::BLOB_SIZE).unwrap_or(0)
        };

        id_cache.set(raw.space_id(), raw.id(), path).await?;
        id_cache.delete_path(prev).await?;
        self.refresh_placement(raw, path).await?;

        inner
            .events
            .publish(Event::ItemMoved {
                resource: ResourceId::new(raw.space_id().clone(), raw.id().clone()),
                old_reference: prev.to_string_lossy().into_owned(),
                timestamp: OffsetDateTime::now_utc(),
            })
            .await;
        inner
            .metrics
            .count_assimilation(item_type(is_dir), metrics::ACTION_MOVED);

        if is_dir {
            // Descendants keep their ids but their cached paths are stale.
            inner.debouncer.enqueue(path, true, true);
        }

        let now = OffsetDateTime::now_utc();

        // Shrink the roll-ups under the vacated parent chain.
        if let Some(old_parent_id) = old_parent_id {
            if moved_size > 0 {
                let phantom = phantom_child(raw, prev, &old_parent_id);
                if let Err(err) = inner
                    .propagator
                    .propagate(&phantom, now, -(moved_size as i64))
                    .await
                {
                    warn!(error = %err, "propagation from the vacated parent failed");
                }
            }
        }

        self.propagate_from_attrs(raw, now, moved_size as i64).await;
        Ok(())
    }

    /// The new-item branch: assign an identity under a path-keyed lock,
    /// checksum content, persist the full attribute set, cache and emit.
    /// Returns the assimilated node.
    async fn assimilate_new(
        &self,
        space_id: &SpaceId,
        space_root: &Path,
        path: &Path,
        propagate: bool,
        depth: usize,
    ) -> FsResult<Node> {
        if depth > MAX_ASSIMILATION_DEPTH {
            return Err(FsError::InvalidReference(format!(
                "assimilation recursion exceeded at {}",
                path.display()
            )));
        }

        let inner = &self.inner;
        let lookup = &inner.lookup;
        let metadata = lookup.metadata();

        // No id exists to key the lock, so the path itself serialises
        // competing workers.
        let _lock = inner.locks.lock(&sibling_lockfile(path)).await?;

        // Another worker may have assigned an id while we waited.
        let identity = metadata.identify_path(space_root, path).await?;
        if let Some(id) = identity.id {
            drop(_lock);
            self.assimilate_known(space_id, space_root, path, id.clone(), identity.mtime)
                .await?;
            return lookup.node_from_id(space_id, &id).await;
        }

        let parent_id = self
            .ensure_parent(space_id, space_root, path, depth)
            .await?;

        let id = lookup
            .id_cache()
            .history_recover(path)
            .map(|(_, node_id)| node_id)
            .unwrap_or_else(NodeId::generate);

        let meta = std::fs::metadata(path)?;
        let mtime = OffsetDateTime::from(meta.modified()?);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), id.as_str().as_bytes().to_vec());
        attrs.insert(attribute::NAME.into(), name.into_bytes());
        attrs.insert(
            attribute::PARENT_ID.into(),
            parent_id.as_str().as_bytes().to_vec(),
        );
        attrs.insert(
            attribute::MTIME.into(),
            format_timestamp(mtime).into_bytes(),
        );

        let size_diff;
        let is_dir = meta.is_dir();
        if is_dir {
            attrs.insert(attribute::TYPE.into(), b"container".to_vec());
            attrs.insert(attribute::TREE_SIZE.into(), b"0".to_vec());
            attrs.insert(attribute::PROPAGATION.into(), b"1".to_vec());
            size_diff = 0;
        } else {
            let checksum_target = path.to_path_buf();
            let (checksums, size) =
                tokio::task::spawn_blocking(move || checksum_file(&checksum_target))
                    .await
                    .map_err(|_| {
                        FsError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "checksum task aborted",
                        ))
                    })??;

            let blob_id = uuid::Uuid::new_v4().to_string();
            if size > 0 {
                inner
                    .blobstore
                    .upload(&BlobRef::new(blob_id.clone(), size), path)
                    .await?;
            }

            attrs.insert(attribute::TYPE.into(), b"file".to_vec());
            attrs.insert(attribute::BLOB_ID.into(), blob_id.into_bytes());
            attrs.insert(
                attribute::BLOB_SIZE.into(),
                size.to_string().into_bytes(),
            );
            attrs.insert(
                attribute::CHECKSUM_SHA1.into(),
                checksums.sha1.into_bytes(),
            );
            attrs.insert(attribute::CHECKSUM_MD5.into(), checksums.md5.into_bytes());
            attrs.insert(
                attribute::CHECKSUM_ADLER32.into(),
                checksums.adler32.into_bytes(),
            );
            attrs.insert(attribute::SCAN_STATUS.into(), b"unscanned".to_vec());
            size_diff = size as i64;
        }

        let raw = RawNode::new(space_id.clone(), space_root, path).with_id(id.clone());
        metadata.set_multiple(&raw, attrs.clone(), false).await?;
        lookup.id_cache().set(space_id, &id, path).await?;

        let node = Node::from_attributes(space_id.clone(), space_root, path, &attrs)?;
        let resource = node.resource_id();
        let parent = Some(ResourceId::new(space_id.clone(), parent_id));

        let event = if is_dir {
            inner
                .metrics
                .count_assimilation(metrics::ITEM_DIR, metrics::ACTION_ADDED);
            Event::ContainerCreated {
                resource,
                parent,
                timestamp: mtime,
            }
        } else {
            inner
                .metrics
                .count_assimilation(metrics::ITEM_FILE, metrics::ACTION_ADDED);
            if node.blob_size() == 0 {
                Event::FileTouched {
                    resource,
                    parent,
                    timestamp: mtime,
                }
            } else {
                Event::UploadReady {
                    resource,
                    parent,
                    timestamp: mtime,
                }
            }
        };
        inner.events.publish(event).await;

        if propagate {
            if let Err(err) = inner.propagator.propagate(&node, mtime, size_diff).await {
                warn!(error = %err, "post-assimilation propagation failed");
            }
        }

        Ok(node)
    }

    /// Guarantees the parent directory carries an id before a child is
    /// adopted below it; events can arrive in any order.
    async fn ensure_parent(
        &self,
        space_id: &SpaceId,
        space_root: &Path,
        path: &Path,
        depth: usize,
    ) -> FsResult<NodeId> {
        let parent = path.parent().ok_or_else(|| {
            FsError::InvalidReference(format!("{} has no parent", path.display()))
        })?;

        if parent == space_root {
            return Ok(NodeId::from(space_id.as_str()));
        }

        let identity = self
            .inner
            .lookup
            .metadata()
            .identify_path(space_root, parent)
            .await?;
        if let Some(id) = identity.id {
            return Ok(id);
        }

        let parent_node = Box::pin(self.assimilate_new(
            space_id,
            space_root,
            parent,
            false,
            depth + 1,
        ))
        .await?;
        Ok(parent_node.id().clone())
    }

    /// Rewrites the placement attributes (name, parent) after a move or a
    /// cache refresh.
    async fn refresh_placement(&self, raw: &RawNode, path: &Path) -> FsResult<()> {
        let parent_id = self
            .ensure_parent(raw.space_id(), raw.space_root(), path, 0)
            .await?;

        let mut updates = Attributes::new();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            updates.insert(attribute::NAME.into(), name.as_bytes().to_vec());
        }
        updates.insert(
            attribute::PARENT_ID.into(),
            parent_id.as_str().as_bytes().to_vec(),
        );
        self.inner
            .lookup
            .metadata()
            .set_multiple(raw, updates, false)
            .await
    }

    /// Refreshes content-derived attributes after an out-of-band change.
    async fn refresh_content(&self, raw: &RawNode, path: &Path, is_dir: bool) -> FsResult<()> {
        let inner = &self.inner;
        let metadata = inner.lookup.metadata();
        let mtime = disk_mtime(path)?;

        if is_dir {
            let mut updates = Attributes::new();
            updates.insert(
                attribute::MTIME.into(),
                format_timestamp(mtime).into_bytes(),
            );
            metadata.set_multiple(raw, updates, false).await?;
            self.propagate_from_attrs(raw, mtime, 0).await;
            return Ok(());
        }

        let old_size = metadata
            .get(raw, attribute::BLOB_SIZE)
            .await
            .ok()
            .and_then(|raw_size| String::from_utf8(raw_size).ok())
            .and_then(|raw_size| raw_size.parse::<u64>().ok())
            .unwrap_or(0);

        let checksum_target = path.to_path_buf();
        let (checksums, size) =
            tokio::task::spawn_blocking(move || checksum_file(&checksum_target))
                .await
                .map_err(|_| {
                    FsError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "checksum task aborted",
                    ))
                })??;

        let blob_id = uuid::Uuid::new_v4().to_string();
        if size > 0 {
            inner
                .blobstore
                .upload(&BlobRef::new(blob_id.clone(), size), path)
                .await?;
        }

        let mut updates = Attributes::new();
        updates.insert(attribute::BLOB_ID.into(), blob_id.into_bytes());
        updates.insert(attribute::BLOB_SIZE.into(), size.to_string().into_bytes());
        updates.insert(
            attribute::MTIME.into(),
            format_timestamp(mtime).into_bytes(),
        );
        updates.insert(
            attribute::CHECKSUM_SHA1.into(),
            checksums.sha1.into_bytes(),
        );
        updates.insert(attribute::CHECKSUM_MD5.into(), checksums.md5.into_bytes());
        updates.insert(
            attribute::CHECKSUM_ADLER32.into(),
            checksums.adler32.into_bytes(),
        );
        updates.insert(attribute::SCAN_STATUS.into(), b"unscanned".to_vec());
        metadata.set_multiple(raw, updates, false).await?;

        self.propagate_from_attrs(raw, mtime, size as i64 - old_size as i64)
            .await;
        Ok(())
    }

    /// Best-effort propagation from a node described only by its stored
    /// attributes.
    async fn propagate_from_attrs(&self, raw: &RawNode, mtime: OffsetDateTime, size_diff: i64) {
        let metadata = self.inner.lookup.metadata();
        let attrs = match metadata.get_all(raw).await {
            Ok(attrs) => attrs,
            Err(err) => {
                warn!(error = %err, "attributes unreadable, skipping propagation");
                return;
            }
        };

        let node = match Node::from_attributes(
            raw.space_id().clone(),
            raw.space_root(),
            raw.internal_path(),
            &attrs,
        ) {
            Ok(node) => node,
            Err(err) => {
                warn!(error = %err, "node unreconstructable, skipping propagation");
                return;
            }
        };

        if let Err(err) = self.inner.propagator.propagate(&node, mtime, size_diff).await {
            warn!(error = %err, "propagation failed");
        }
    }

    /// Handles a vanished path: purge caches and metadata, emit a trash
    /// notification with a best-effort parent reference.
    pub async fn handle_file_delete(&self, path: &Path, is_dir_hint: bool) -> FsResult<()> {
        if path.exists() {
            // The entry reappeared inside the debounce window.
            return Ok(());
        }

        let inner = &self.inner;
        let lookup = &inner.lookup;
        let id_cache = lookup.id_cache();

        let identity = id_cache.get_by_path(path).await?;
        let space_root = space_root_of(lookup.config(), path);

        if let (Some((space_id, node_id)), Some(space_root)) = (&identity, &space_root) {
            id_cache.delete_by_path(path).await?;

            let raw = RawNode::new(space_id.clone(), space_root, path).with_id(node_id.clone());
            if let Err(err) = lookup.metadata().purge(&raw).await {
                warn!(path = %path.display(), error = %err, "metadata purge after delete failed");
            }
        }

        let parent = match (&space_root, path.parent()) {
            (Some(space_root), Some(parent_path)) => lookup
                .metadata()
                .identify_path(space_root, parent_path)
                .await
                .ok()
                .and_then(|identity| identity.id)
                .and_then(|parent_id| {
                    identity
                        .as_ref()
                        .map(|(space_id, _)| ResourceId::new(space_id.clone(), parent_id))
                }),
            _ => None,
        };

        inner
            .events
            .publish(Event::ItemTrashed {
                owner: None,
                executant: None,
                resource: identity
                    .map(|(space_id, node_id)| ResourceId::new(space_id, node_id)),
                parent,
                timestamp: OffsetDateTime::now_utc(),
            })
            .await;
        inner
            .metrics
            .count_assimilation(item_type(is_dir_hint), metrics::ACTION_DELETED);

        Ok(())
    }
}

fn item_type(is_dir: bool) -> &'static str {
    if is_dir {
        metrics::ITEM_DIR
    } else {
        metrics::ITEM_FILE
    }
}

/// A minimal node standing in for a child that used to live under
/// `old_parent`, so the propagator can walk the vacated chain.
fn phantom_child(raw: &RawNode, prev: &Path, old_parent_id: &NodeId) -> Node {
    Node::phantom(
        raw.space_id().clone(),
        raw.space_root(),
        prev,
        raw.id().clone(),
        old_parent_id.clone(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use crate::blobstore::MemoryBlobstore;
    use crate::config::EngineConfig;
    use crate::events::MemoryEventSink;
    use crate::idcache::IdCache;
    use crate::metadata::{MetadataBackend, XattrsBackend};
    use crate::propagator::test_support::{seed_container, tree_size_of};
    use crate::propagator::SyncPropagator;
    use crate::users::NoopUserMapper;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        space_id: SpaceId,
        lookup: Arc<Lookup>,
        assimilator: Assimilator,
        events: Arc<MemoryEventSink>,
        metrics: Arc<Metrics>,
        _rx: mpsc::Receiver<ScanItem>,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_root(dir.path());
        config.debounce_delay_ms = 10;
        let config = Arc::new(config);

        let locks = Arc::new(LockManager::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(XattrsBackend::new(locks.clone()));
        let id_cache = Arc::new(
            IdCache::open(&config.id_cache_path(), Duration::from_secs(60)).unwrap(),
        );
        let lookup = Arc::new(Lookup::new(config, metadata, id_cache));

        let space_id = SpaceId::from("space-root-1");
        let root = dir.path().join("users/marie");
        seed_container(&lookup, &space_id, &root, &root, space_id.as_str(), None).await;

        let events = MemoryEventSink::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let propagator = Arc::new(SyncPropagator::new(lookup.clone()));
        let (assimilator, rx) = Assimilator::new(
            lookup.clone(),
            MemoryBlobstore::new(),
            propagator,
            events.clone(),
            metrics.clone(),
            Arc::new(NoopUserMapper),
            locks,
        );

        Fixture {
            _dir: dir,
            root,
            space_id,
            lookup,
            assimilator,
            events,
            metrics,
            _rx: rx,
        }
    }

    fn scan(path: &Path) -> ScanItem {
        ScanItem {
            path: path.to_path_buf(),
            recurse: false,
            is_dir_hint: false,
        }
    }

    #[tokio::test]
    async fn new_file_gets_an_id_checksums_and_an_event() {
        let fx = fixture().await;
        let target = fx.root.join("assimilated.txt");
        std::fs::write(&target, b"").unwrap();

        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();

        let node = fx
            .lookup
            .node_from_reference(&crate::lookup::Reference::space_relative(
                &fx.space_id,
                "/assimilated.txt",
            ))
            .await
            .unwrap();
        assert!(!node.id().as_str().is_empty());
        assert_eq!(node.blob_size(), 0);

        let attrs = fx
            .lookup
            .metadata()
            .get_all_at(&fx.root, &target)
            .await
            .unwrap();
        assert!(attr_str(&attrs, attribute::CHECKSUM_ADLER32).is_some_and(|cs| !cs.is_empty()));

        let events = fx.events.drain();
        assert!(matches!(events.as_slice(), [Event::FileTouched { .. }]));
        assert_eq!(
            fx.metrics.assimilation_total(metrics::ITEM_FILE, metrics::ACTION_ADDED),
            1
        );
    }

    #[tokio::test]
    async fn nested_file_assimilates_its_parents_first() {
        let fx = fixture().await;
        let target = fx.root.join("a/b/leaf.txt");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"payload").unwrap();

        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();

        let leaf = fx
            .lookup
            .node_from_reference(&crate::lookup::Reference::space_relative(
                &fx.space_id,
                "/a/b/leaf.txt",
            ))
            .await
            .unwrap();
        assert_eq!(leaf.blob_size(), 7);

        // Both ancestors were adopted and sizes rolled up to the root.
        assert_eq!(
            tree_size_of(fx.lookup.metadata(), &fx.root, &fx.root).await,
            Some(7)
        );
    }

    #[tokio::test]
    async fn rename_keeps_the_id_and_emits_item_moved() {
        let fx = fixture().await;
        let original = fx.root.join("original.txt");
        std::fs::write(&original, b"x").unwrap();
        fx.assimilator
            .assimilate_item(&scan(&original))
            .await
            .unwrap();

        let before = fx
            .lookup
            .id_cache()
            .get_by_path(&original)
            .await
            .unwrap()
            .unwrap();
        fx.events.drain();

        let moved = fx.root.join("moved.txt");
        std::fs::rename(&original, &moved).unwrap();
        fx.assimilator.assimilate_item(&scan(&moved)).await.unwrap();

        assert!(fx
            .lookup
            .id_cache()
            .get_by_path(&original)
            .await
            .unwrap()
            .is_none());
        let after = fx
            .lookup
            .id_cache()
            .get_by_path(&moved)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.1, after.1, "rename changed the node id");

        let events = fx.events.drain();
        assert!(matches!(events.as_slice(), [Event::ItemMoved { .. }]));
    }

    #[tokio::test]
    async fn id_clash_on_copy_yields_a_fresh_id() {
        let fx = fixture().await;
        let original = fx.root.join("a.txt");
        std::fs::write(&original, b"x").unwrap();
        fx.assimilator
            .assimilate_item(&scan(&original))
            .await
            .unwrap();

        let (_, original_id) = fx
            .lookup
            .id_cache()
            .get_by_path(&original)
            .await
            .unwrap()
            .unwrap();

        // A copy that preserved the extended attributes.
        let copy = fx.root.join("b.txt");
        std::fs::write(&copy, b"x").unwrap();
        for (key, value) in fx
            .lookup
            .metadata()
            .get_all_at(&fx.root, &original)
            .await
            .unwrap()
        {
            xattr::set(&copy, &key, &value).unwrap();
        }

        // First pass detects the clash and purges; the rescheduled pass
        // assigns a fresh identity.
        fx.assimilator.assimilate_item(&scan(&copy)).await.unwrap();
        fx.assimilator.assimilate_item(&scan(&copy)).await.unwrap();

        let (_, copy_id) = fx
            .lookup
            .id_cache()
            .get_by_path(&copy)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(copy_id, original_id);

        let (_, still_original) = fx
            .lookup
            .id_cache()
            .get_by_path(&original)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(still_original, original_id);
    }

    #[tokio::test]
    async fn self_induced_events_are_recognised() {
        let fx = fixture().await;
        let target = fx.root.join("quiet.txt");
        std::fs::write(&target, b"x").unwrap();
        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();
        fx.events.drain();

        // Same path, same stored mtime: nothing to do, no events.
        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();
        assert!(fx.events.drain().is_empty());
    }

    #[tokio::test]
    async fn delete_purges_the_cache_and_emits_item_trashed() {
        let fx = fixture().await;
        let target = fx.root.join("doomed.txt");
        std::fs::write(&target, b"x").unwrap();
        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();
        fx.events.drain();

        std::fs::remove_file(&target).unwrap();
        fx.assimilator
            .handle_file_delete(&target, false)
            .await
            .unwrap();

        assert!(fx
            .lookup
            .id_cache()
            .get_by_path(&target)
            .await
            .unwrap()
            .is_none());
        let events = fx.events.drain();
        assert!(matches!(events.as_slice(), [Event::ItemTrashed { .. }]));
        assert_eq!(
            fx.metrics.assimilation_total(metrics::ITEM_FILE, metrics::ACTION_DELETED),
            1
        );
    }

    #[tokio::test]
    async fn move_out_history_revives_the_id_on_move_in() {
        let fx = fixture().await;
        let target = fx.root.join("wanderer.txt");
        std::fs::write(&target, b"x").unwrap();
        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();
        let (_, id) = fx
            .lookup
            .id_cache()
            .get_by_path(&target)
            .await
            .unwrap()
            .unwrap();

        // Moved out of the tree: xattrs are stripped by the destination
        // filesystem, only the history remembers the identity.
        fx.assimilator
            .dispatch(Action::new(ActionKind::MoveFrom, false, &target))
            .await;
        std::fs::remove_file(&target).unwrap();
        std::fs::write(&target, b"x").unwrap();

        fx.assimilator.assimilate_item(&scan(&target)).await.unwrap();
        let (_, revived) = fx
            .lookup
            .id_cache()
            .get_by_path(&target)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revived, id);
    }
}
