//! # Id cache
//!
//! The durable bi-directional map between `(space_id, node_id)` and the
//! absolute on-disk path of the live node. It is the authoritative index
//! used to avoid full-tree walks, not a mere accelerator, so it is backed
//! by an embedded store and both directions are updated in a single write
//! transaction.
//!
//! A secondary in-memory id-history records the identity of recently
//! moved-out paths for a short TTL, so a move-out / move-in pair observed
//! as separate watcher events can still recover the original id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use redb::{Database, ReadableTable, TableDefinition};
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::node::{NodeId, SpaceId};

const FORWARD: TableDefinition<&str, &str> = TableDefinition::new("id_to_path");
const REVERSE: TableDefinition<&str, &str> = TableDefinition::new("path_to_id");

fn store_error(err: impl std::fmt::Display) -> FsError {
    FsError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("id cache store failure: {err}"),
    ))
}

fn forward_key(space_id: &SpaceId, node_id: &NodeId) -> String {
    format!("{space_id}!{node_id}")
}

fn path_key(path: &Path) -> FsResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| FsError::InvalidReference(format!("non-utf8 path {}", path.display())))
}

fn split_identity(raw: &str) -> Option<(SpaceId, NodeId)> {
    raw.split_once('!')
        .map(|(space, node)| (SpaceId::from(space), NodeId::from(node)))
}

#[derive(Clone)]
struct HistoryEntry {
    space_id: SpaceId,
    node_id: NodeId,
    stored_at: Instant,
}

pub struct IdCache {
    db: Arc<Database>,
    history: Mutex<HashMap<String, HistoryEntry>>,
    history_ttl: Duration,
}

impl IdCache {
    /// Opens (or creates) the cache database and makes sure both tables
    /// exist so read transactions never observe a missing table.
    pub fn open(path: &Path, history_ttl: Duration) -> FsResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(store_error)?;
        let txn = db.begin_write().map_err(store_error)?;
        {
            txn.open_table(FORWARD).map_err(store_error)?;
            txn.open_table(REVERSE).map_err(store_error)?;
        }
        txn.commit().map_err(store_error)?;

        Ok(Self {
            db: Arc::new(db),
            history: Mutex::new(HashMap::new()),
            history_ttl,
        })
    }

    /// Forward lookup: where does the live node currently sit on disk.
    pub async fn get(&self, space_id: &SpaceId, node_id: &NodeId) -> FsResult<Option<PathBuf>> {
        let db = self.db.clone();
        let key = forward_key(space_id, node_id);

        tokio::task::spawn_blocking(move || -> FsResult<Option<PathBuf>> {
            let txn = db.begin_read().map_err(store_error)?;
            let table = txn.open_table(FORWARD).map_err(store_error)?;
            let found = table
                .get(key.as_str())
                .map_err(store_error)?
                .map(|guard| PathBuf::from(guard.value()));
            Ok(found)
        })
        .await
        .map_err(store_error)?
    }

    /// Reverse lookup: which node identity owns this path.
    pub async fn get_by_path(&self, path: &Path) -> FsResult<Option<(SpaceId, NodeId)>> {
        let db = self.db.clone();
        let key = path_key(path)?;

        tokio::task::spawn_blocking(move || -> FsResult<Option<(SpaceId, NodeId)>> {
            let txn = db.begin_read().map_err(store_error)?;
            let table = txn.open_table(REVERSE).map_err(store_error)?;
            let found = table
                .get(key.as_str())
                .map_err(store_error)?
                .and_then(|guard| split_identity(guard.value()));
            Ok(found)
        })
        .await
        .map_err(store_error)?
    }

    /// Registers both directions; a stale reverse entry left over from the
    /// node's previous location is dropped in the same transaction.
    pub async fn set(&self, space_id: &SpaceId, node_id: &NodeId, path: &Path) -> FsResult<()> {
        let db = self.db.clone();
        let fwd_key = forward_key(space_id, node_id);
        let new_path = path_key(path)?;

        tokio::task::spawn_blocking(move || -> FsResult<()> {
            let txn = db.begin_write().map_err(store_error)?;
            {
                let mut forward = txn.open_table(FORWARD).map_err(store_error)?;
                let mut reverse = txn.open_table(REVERSE).map_err(store_error)?;

                let previous = forward
                    .insert(fwd_key.as_str(), new_path.as_str())
                    .map_err(store_error)?
                    .map(|guard| guard.value().to_string());
                if let Some(previous) = previous {
                    if previous != new_path {
                        reverse.remove(previous.as_str()).map_err(store_error)?;
                    }
                }

                reverse
                    .insert(new_path.as_str(), fwd_key.as_str())
                    .map_err(store_error)?;
            }
            txn.commit().map_err(store_error)?;
            Ok(())
        })
        .await
        .map_err(store_error)?
    }

    /// Removes both directions for a node identity.
    pub async fn delete(&self, space_id: &SpaceId, node_id: &NodeId) -> FsResult<()> {
        let db = self.db.clone();
        let fwd_key = forward_key(space_id, node_id);

        tokio::task::spawn_blocking(move || -> FsResult<()> {
            let txn = db.begin_write().map_err(store_error)?;
            {
                let mut forward = txn.open_table(FORWARD).map_err(store_error)?;
                let mut reverse = txn.open_table(REVERSE).map_err(store_error)?;

                let removed = forward
                    .remove(fwd_key.as_str())
                    .map_err(store_error)?
                    .map(|guard| guard.value().to_string());
                if let Some(path) = removed {
                    reverse.remove(path.as_str()).map_err(store_error)?;
                }
            }
            txn.commit().map_err(store_error)?;
            Ok(())
        })
        .await
        .map_err(store_error)?
    }

    /// Recursively removes every entry for `path` and its descendants, in
    /// both directions.
    pub async fn delete_by_path(&self, path: &Path) -> FsResult<()> {
        let db = self.db.clone();
        let prefix = path_key(path)?;

        tokio::task::spawn_blocking(move || -> FsResult<()> {
            let descendant_prefix = format!("{prefix}/");

            let txn = db.begin_write().map_err(store_error)?;
            {
                let mut forward = txn.open_table(FORWARD).map_err(store_error)?;
                let mut reverse = txn.open_table(REVERSE).map_err(store_error)?;

                let mut doomed = Vec::new();
                for entry in reverse.range(prefix.as_str()..).map_err(store_error)? {
                    let (key, value) = entry.map_err(store_error)?;
                    let key = key.value();
                    if key != prefix && !key.starts_with(&descendant_prefix) {
                        break;
                    }
                    doomed.push((key.to_string(), value.value().to_string()));
                }

                for (rev_key, fwd_key) in doomed {
                    trace!(path = %rev_key, identity = %fwd_key, "dropping cache entry");
                    reverse.remove(rev_key.as_str()).map_err(store_error)?;
                    forward.remove(fwd_key.as_str()).map_err(store_error)?;
                }
            }
            txn.commit().map_err(store_error)?;
            Ok(())
        })
        .await
        .map_err(store_error)?
    }

    /// Removes only the reverse entry of a path, leaving the forward entry
    /// pointing at the node's new location.
    pub async fn delete_path(&self, path: &Path) -> FsResult<()> {
        let db = self.db.clone();
        let key = path_key(path)?;

        tokio::task::spawn_blocking(move || -> FsResult<()> {
            let txn = db.begin_write().map_err(store_error)?;
            {
                let mut reverse = txn.open_table(REVERSE).map_err(store_error)?;
                reverse.remove(key.as_str()).map_err(store_error)?;
            }
            txn.commit().map_err(store_error)?;
            Ok(())
        })
        .await
        .map_err(store_error)?
    }

    /// Remembers which identity just vacated `path`.
    pub fn history_store(&self, path: &Path, space_id: SpaceId, node_id: NodeId) {
        let Ok(key) = path_key(path) else { return };
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        history.insert(
            key,
            HistoryEntry {
                space_id,
                node_id,
                stored_at: Instant::now(),
            },
        );
    }

    /// Returns the identity that vacated `path` within the TTL, if any.
    pub fn history_recover(&self, path: &Path) -> Option<(SpaceId, NodeId)> {
        let key = path_key(path).ok()?;
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let ttl = self.history_ttl;
        history.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        history
            .remove(&key)
            .map(|entry| (entry.space_id, entry.node_id))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, IdCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = IdCache::open(&dir.path().join("idcache.redb"), Duration::from_secs(60))
            .unwrap();
        (dir, cache)
    }

    fn identity(n: u32) -> (SpaceId, NodeId) {
        (SpaceId::from("space-1"), NodeId::from(format!("node-{n}").as_str()))
    }

    #[tokio::test]
    async fn set_then_lookup_in_both_directions() {
        let (_dir, cache) = fixture().await;
        let (space, node) = identity(1);
        let path = Path::new("/spaces/s1/docs/report.txt");

        cache.set(&space, &node, path).await.unwrap();

        assert_eq!(cache.get(&space, &node).await.unwrap().unwrap(), path);
        let (found_space, found_node) = cache.get_by_path(path).await.unwrap().unwrap();
        assert_eq!(found_space, space);
        assert_eq!(found_node, node);
    }

    #[tokio::test]
    async fn re_set_drops_the_stale_reverse_entry() {
        let (_dir, cache) = fixture().await;
        let (space, node) = identity(1);
        let old = Path::new("/spaces/s1/a.txt");
        let new = Path::new("/spaces/s1/b.txt");

        cache.set(&space, &node, old).await.unwrap();
        cache.set(&space, &node, new).await.unwrap();

        assert!(cache.get_by_path(old).await.unwrap().is_none());
        assert_eq!(cache.get(&space, &node).await.unwrap().unwrap(), new);
    }

    #[tokio::test]
    async fn delete_by_path_is_recursive_but_bounded() {
        let (_dir, cache) = fixture().await;
        let (space, _) = identity(0);

        let entries = [
            ("node-1", "/spaces/s1/docs"),
            ("node-2", "/spaces/s1/docs/a.txt"),
            ("node-3", "/spaces/s1/docs/sub/b.txt"),
            ("node-4", "/spaces/s1/docs-other/c.txt"),
        ];
        for (id, path) in entries {
            cache
                .set(&space, &NodeId::from(id), Path::new(path))
                .await
                .unwrap();
        }

        cache
            .delete_by_path(Path::new("/spaces/s1/docs"))
            .await
            .unwrap();

        for (id, path) in &entries[..3] {
            assert!(cache
                .get(&space, &NodeId::from(*id))
                .await
                .unwrap()
                .is_none());
            assert!(cache.get_by_path(Path::new(path)).await.unwrap().is_none());
        }

        // The sibling with the shared name prefix survives.
        assert!(cache
            .get_by_path(Path::new("/spaces/s1/docs-other/c.txt"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_path_leaves_the_forward_entry() {
        let (_dir, cache) = fixture().await;
        let (space, node) = identity(1);
        let path = Path::new("/spaces/s1/a.txt");

        cache.set(&space, &node, path).await.unwrap();
        cache.delete_path(path).await.unwrap();

        assert!(cache.get_by_path(path).await.unwrap().is_none());
        assert!(cache.get(&space, &node).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn history_recovers_within_ttl_once() {
        let (_dir, cache) = fixture().await;
        let (space, node) = identity(1);
        let path = Path::new("/spaces/s1/a.txt");

        cache.history_store(path, space.clone(), node.clone());
        let (recovered_space, recovered_node) = cache.history_recover(path).unwrap();
        assert_eq!(recovered_space, space);
        assert_eq!(recovered_node, node);

        // Consumed on recovery.
        assert!(cache.history_recover(path).is_none());
    }
}
