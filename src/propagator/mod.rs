//! # Propagator
//!
//! Rolls tree-size and tree-mtime changes from a mutated node up to the
//! space root. Walks the parent chain, updating each ancestor under its
//! metadata lock, and stops immediately at an ancestor that carries a
//! propagation stop boundary. Failures are isolated per ancestor: a write
//! failure on one level neither rolls back levels already updated nor
//! prevents the walk from continuing.

mod asynchronous;

pub use asynchronous::AsyncPropagator;

use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{instrument, trace, warn};

use crate::error::FsResult;
use crate::layout;
use crate::lookup::Lookup;
use crate::metadata::{attr_str, attr_time, attr_u64, attribute, Attributes};
use crate::node::{MetaNode, Node};
use crate::utils::format_timestamp;

#[async_trait]
pub trait Propagator: Send + Sync {
    /// Records that `node` changed at `sync_time`, shifting the subtree
    /// size by `size_diff` bytes. With both accounting toggles off and a
    /// zero diff this is a no-op.
    async fn propagate(&self, node: &Node, sync_time: OffsetDateTime, size_diff: i64)
        -> FsResult<()>;
}

/// True when the attribute set marks a propagation stop boundary. Only an
/// explicit non-"1" value stops the walk; nodes that never got the
/// attribute still propagate.
pub(crate) fn stops_propagation(attrs: &Attributes) -> bool {
    matches!(attr_str(attrs, attribute::PROPAGATION), Some(value) if value != "1")
}

/// Recomputes a container's tree size by a bounded walk over its direct
/// children: file sizes plus child-container tree sizes.
pub(crate) async fn recompute_tree_size(lookup: &Lookup, ancestor: &Node) -> FsResult<u64> {
    let metadata = lookup.metadata();
    let mut total = 0u64;

    let mut entries = tokio::fs::read_dir(ancestor.internal_path()).await?;
    while let Some(entry) = entries.next_entry().await? {
        let child_path = entry.path();
        if layout::is_metafile(&child_path)
            || layout::is_internal_path(ancestor.space_root(), &child_path)
        {
            continue;
        }

        let attrs = match metadata.get_all_at(ancestor.space_root(), &child_path).await {
            Ok(attrs) => attrs,
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        };

        if entry.file_type().await?.is_dir() {
            total += attr_u64(&attrs, attribute::TREE_SIZE).unwrap_or(0);
        } else {
            let size = match attr_u64(&attrs, attribute::BLOB_SIZE) {
                Some(size) => size,
                None => entry.metadata().await?.len(),
            };
            total += size;
        }
    }

    Ok(total)
}

/// Applies one combined update to a single ancestor under its metadata
/// lock. Returns whether the caller should continue walking upward.
#[instrument(level = tracing::Level::TRACE, skip(lookup, ancestor), fields(ancestor = %ancestor.id()))]
pub(crate) async fn apply_rollup(
    lookup: &Lookup,
    ancestor: &Node,
    sync_time: OffsetDateTime,
    size_diff: i64,
) -> FsResult<bool> {
    let config = lookup.config();
    let metadata = lookup.metadata();

    let _guard = metadata.lock(ancestor).await?;
    let attrs = metadata.get_all(ancestor).await?;

    if stops_propagation(&attrs) {
        trace!("ancestor is a propagation stop boundary");
        return Ok(false);
    }

    let mut updates = Attributes::new();

    if config.tree_time_accounting {
        let known = attr_time(&attrs, attribute::TREE_MTIME);
        if known.map_or(true, |current| current < sync_time) {
            updates.insert(
                attribute::TREE_MTIME.to_string(),
                format_timestamp(sync_time).into_bytes(),
            );
        }
    }

    if config.tree_size_accounting && size_diff != 0 {
        let updated = match attr_u64(&attrs, attribute::TREE_SIZE) {
            Some(current) => {
                let shifted = current as i64 + size_diff;
                if shifted < 0 {
                    warn!(
                        current,
                        size_diff,
                        "tree size rollover below zero, resetting"
                    );
                    0
                } else {
                    shifted as u64
                }
            }
            None => {
                warn!("tree size unreadable, recomputing from children");
                recompute_tree_size(lookup, ancestor).await?
            }
        };
        updates.insert(
            attribute::TREE_SIZE.to_string(),
            updated.to_string().into_bytes(),
        );
    }

    if !updates.is_empty() {
        metadata.set_multiple(ancestor, updates, false).await?;
    }

    // The temporary etag only survives until the next propagated change.
    if attrs.contains_key(attribute::TMP_ETAG) {
        metadata
            .remove(ancestor, attribute::TMP_ETAG, false)
            .await?;
    }

    Ok(true)
}

/// Synchronous propagator: walks and updates inline on the caller's task.
pub struct SyncPropagator {
    lookup: Arc<Lookup>,
}

impl SyncPropagator {
    pub fn new(lookup: Arc<Lookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl Propagator for SyncPropagator {
    async fn propagate(
        &self,
        node: &Node,
        sync_time: OffsetDateTime,
        size_diff: i64,
    ) -> FsResult<()> {
        let config = self.lookup.config();
        if !config.tree_time_accounting && (!config.tree_size_accounting || size_diff == 0) {
            return Ok(());
        }

        let mut current = node.clone();
        while let Some(parent_id) = current.parent_id().cloned() {
            let ancestor = match self.lookup.node_from_id(node.space_id(), &parent_id).await {
                Ok(ancestor) => ancestor,
                Err(err) => {
                    warn!(%parent_id, error = %err, "ancestor unresolvable, propagation stops here");
                    return Ok(());
                }
            };

            match apply_rollup(&self.lookup, &ancestor, sync_time, size_diff).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => {
                    // Levels already updated stay updated; keep walking so
                    // outer roll-ups don't silently drift further.
                    warn!(ancestor = %ancestor.id(), error = %err, "rollup failed on one level");
                }
            }

            if ancestor.is_space_root() {
                break;
            }
            current = ancestor;
        }

        Ok(())
    }
}
