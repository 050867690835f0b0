//! # Engine facade
//!
//! Wires configuration into a running space engine: metadata backend, id
//! cache, lookup, blobstore, propagator, tree surface, trash, revisions,
//! watcher and the assimilation worker pool. Shutdown drains through a
//! watch channel; pending async-propagation work survives on disk and is
//! recovered by the janitor on the next start.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::assimilation::Assimilator;
use crate::blobstore::{Blobstore, LocalBlobstore};
use crate::config::{EngineConfig, PropagationMode};
use crate::error::FsResult;
use crate::events::{EventSink, NoopEventSink};
use crate::idcache::IdCache;
use crate::lookup::Lookup;
use crate::metadata::{backend_from_config, LockManager};
use crate::metrics::Metrics;
use crate::permissions::{AllowAll, PermissionResolver};
use crate::propagator::{AsyncPropagator, Propagator, SyncPropagator};
use crate::revisions::Revisions;
use crate::trashbin::Trashbin;
use crate::tree::Tree;
use crate::users::{NoopUserMapper, UserMapper};
use crate::version::full_version;
use crate::watcher::InotifyWatcher;

pub struct SpaceEngineBuilder {
    config: EngineConfig,
    blobstore: Option<Arc<dyn Blobstore>>,
    permissions: Arc<dyn PermissionResolver>,
    events: Arc<dyn EventSink>,
    users: Arc<dyn UserMapper>,
    watch_filesystem: bool,
}

impl SpaceEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            blobstore: None,
            permissions: Arc::new(AllowAll),
            events: Arc::new(NoopEventSink),
            users: Arc::new(NoopUserMapper),
            watch_filesystem: true,
        }
    }

    pub fn with_blobstore(mut self, blobstore: Arc<dyn Blobstore>) -> Self {
        self.blobstore = Some(blobstore);
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionResolver>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_users(mut self, users: Arc<dyn UserMapper>) -> Self {
        self.users = users;
        self
    }

    /// Disables the filesystem watcher; assimilation then only runs for
    /// explicitly enqueued scans and warm-ups.
    pub fn without_watcher(mut self) -> Self {
        self.watch_filesystem = false;
        self
    }

    pub async fn build(self) -> FsResult<SpaceEngine> {
        let config = Arc::new(self.config);
        info!(version = %full_version(), root = %config.root.display(), "starting space engine");

        std::fs::create_dir_all(&config.root)?;
        std::fs::create_dir_all(config.root.join("users"))?;
        std::fs::create_dir_all(config.root.join("projects"))?;

        let locks = Arc::new(LockManager::new());
        let metadata = backend_from_config(&config, locks.clone());
        let id_cache = Arc::new(IdCache::open(
            &config.id_cache_path(),
            config.id_history_ttl(),
        )?);
        let lookup = Arc::new(Lookup::new(config.clone(), metadata, id_cache));

        let blobstore = self
            .blobstore
            .unwrap_or_else(|| Arc::new(LocalBlobstore::new(config.blob_root())));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let propagator: Arc<dyn Propagator> = match config.propagation_mode {
            PropagationMode::Sync => Arc::new(SyncPropagator::new(lookup.clone())),
            PropagationMode::Async => {
                let propagator = AsyncPropagator::new(lookup.clone());
                tasks.push(propagator.start_janitor(shutdown_rx.clone()));
                Arc::new(propagator)
            }
        };

        let revisions = Arc::new(Revisions::new(lookup.clone(), blobstore.clone()));
        let trashbin = Arc::new(Trashbin::new(
            lookup.clone(),
            blobstore.clone(),
            revisions.clone(),
        ));
        let tree = Arc::new(Tree::new(
            lookup.clone(),
            blobstore.clone(),
            propagator.clone(),
            revisions.clone(),
            trashbin.clone(),
            self.permissions,
            self.events.clone(),
        ));

        let metrics = Arc::new(Metrics::new()?);
        let (assimilator, scan_rx) = Assimilator::new(
            lookup.clone(),
            blobstore,
            propagator,
            self.events,
            metrics.clone(),
            self.users,
            locks,
        );
        tasks.extend(assimilator.spawn_workers(scan_rx, shutdown_rx.clone()));

        let watcher = if self.watch_filesystem {
            let (action_tx, mut action_rx) = mpsc::channel(1024);
            let watcher = InotifyWatcher::spawn(&config.root, config.clone(), action_tx)?;

            let bridge_assimilator = assimilator.clone();
            let mut bridge_shutdown = shutdown_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        action = action_rx.recv() => {
                            let Some(action) = action else {
                                debug!("action stream ended");
                                return;
                            };
                            bridge_assimilator.dispatch(action).await;
                        }
                        _ = bridge_shutdown.changed() => {
                            if *bridge_shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));

            Some(watcher)
        } else {
            None
        };

        Ok(SpaceEngine {
            config,
            lookup,
            tree,
            revisions,
            trashbin,
            assimilator,
            metrics,
            _watcher: watcher,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

pub struct SpaceEngine {
    config: Arc<EngineConfig>,
    lookup: Arc<Lookup>,
    tree: Arc<Tree>,
    revisions: Arc<Revisions>,
    trashbin: Arc<Trashbin>,
    assimilator: Assimilator,
    metrics: Arc<Metrics>,
    _watcher: Option<InotifyWatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SpaceEngine {
    pub fn builder(config: EngineConfig) -> SpaceEngineBuilder {
        SpaceEngineBuilder::new(config)
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn revisions(&self) -> &Arc<Revisions> {
        &self.revisions
    }

    pub fn trashbin(&self) -> &Arc<Trashbin> {
        &self.trashbin
    }

    pub fn assimilator(&self) -> &Assimilator {
        &self.assimilator
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stops the watcher bridge, the worker pool and the janitor. Work
    /// already journalled on disk is picked up on the next start.
    pub async fn shutdown(mut self) {
        if self.shutdown.send(true).is_err() {
            warn!("engine tasks already gone at shutdown");
        }
        self._watcher.take();

        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "engine task ended abnormally");
                }
            }
        }
    }
}
