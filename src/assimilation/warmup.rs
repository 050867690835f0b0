//! Bounded cache warm-up.
//!
//! Walks a subtree, refreshing the reverse index for every known node,
//! optionally adopting unknown ones, and recomputing per-directory tree
//! sizes from the file sizes actually on disk. The sizes are written back
//! and the difference against the previously stored roll-up is propagated
//! beyond the walk root. Honours the cancellation handle at every file
//! boundary.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::assimilation::Assimilator;
use crate::error::{FsError, FsResult};
use crate::layout;
use crate::metadata::{attr_str, attr_u64, attribute, Attributes};
use crate::node::{Node, RawNode, SpaceId};
use crate::utils::Cancellation;

impl Assimilator {
    /// Reconciles the subtree rooted at `root`. Returns the recomputed
    /// tree size of `root`.
    #[instrument(level = tracing::Level::DEBUG, skip(self, cancel), fields(root = %root.display()))]
    pub async fn warmup_id_cache(
        &self,
        root: &Path,
        assimilate: bool,
        only_dirty: bool,
        cancel: &Cancellation,
    ) -> FsResult<u64> {
        let lookup = self.inner.lookup.clone();

        let Some(space_root) = lookup.find_space_root(root).await? else {
            return Err(FsError::not_found(format!(
                "no space above {}",
                root.display()
            )));
        };
        let space_id = lookup.space_id_of_root(&space_root).await?;

        let previous = lookup
            .metadata()
            .get_all_at(&space_root, root)
            .await
            .ok()
            .and_then(|attrs| attr_u64(&attrs, attribute::TREE_SIZE))
            .unwrap_or(0);

        let computed = self
            .warm_dir(&space_id, &space_root, root, assimilate, only_dirty, cancel)
            .await?;

        let diff = computed as i64 - previous as i64;
        if diff != 0 {
            debug!(previous, computed, "tree size drifted, propagating the difference");
        }

        // Ancestors beyond the walk root still hold the old roll-up.
        match lookup.metadata().get_all_at(&space_root, root).await {
            Ok(attrs) => {
                if let Ok(node) =
                    Node::from_attributes(space_id.clone(), &space_root, root, &attrs)
                {
                    if let Err(err) = self
                        .inner
                        .propagator
                        .propagate(&node, OffsetDateTime::now_utc(), diff)
                        .await
                    {
                        warn!(error = %err, "post-warmup propagation failed");
                    }
                }
            }
            Err(err) => warn!(error = %err, "walk root unreadable after warm-up"),
        }

        Ok(computed)
    }

    fn warm_dir<'a>(
        &'a self,
        space_id: &'a SpaceId,
        space_root: &'a Path,
        dir: &'a Path,
        assimilate: bool,
        only_dirty: bool,
        cancel: &'a Cancellation,
    ) -> Pin<Box<dyn Future<Output = FsResult<u64>> + Send + 'a>> {
        Box::pin(async move {
            cancel.check()?;

            let lookup = &self.inner.lookup;
            let metadata = lookup.metadata();

            let dir_attrs = metadata
                .get_all_at(space_root, dir)
                .await
                .unwrap_or_default();
            let dir_id = attr_str(&dir_attrs, attribute::ID).map(str::to_string);

            if only_dirty && attr_str(&dir_attrs, attribute::DIRTY) == Some("0") {
                return Ok(attr_u64(&dir_attrs, attribute::TREE_SIZE).unwrap_or(0));
            }

            // Adopt the directory itself when it is unknown.
            if dir_id.is_none() && assimilate && dir != space_root {
                self.assimilate_new(space_id, space_root, dir, false, 0)
                    .await?;
            } else if let Some(id) = &dir_id {
                lookup
                    .id_cache()
                    .set(space_id, &crate::node::NodeId::from(id.as_str()), dir)
                    .await?;
            }

            let mut total = 0u64;
            let mut entries = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                cancel.check()?;

                let child = entry.path();
                if layout::is_internal_path(space_root, &child)
                    || layout::is_metafile(&child)
                {
                    continue;
                }

                if entry.file_type().await?.is_dir() {
                    total += self
                        .warm_dir(space_id, space_root, &child, assimilate, only_dirty, cancel)
                        .await?;
                    continue;
                }

                let size = entry.metadata().await?.len();
                total += size;

                let identity = metadata.identify_path(space_root, &child).await?;
                match identity.id {
                    Some(id) => {
                        lookup.id_cache().set(space_id, &id, &child).await?;
                    }
                    None if assimilate => {
                        self.assimilate_new(space_id, space_root, &child, false, 0)
                            .await?;
                    }
                    None => {}
                }
            }

            let mut updates = Attributes::new();
            updates.insert(
                attribute::TREE_SIZE.into(),
                total.to_string().into_bytes(),
            );
            updates.insert(attribute::DIRTY.into(), b"0".to_vec());

            let raw = match dir_id {
                Some(id) => RawNode::new(space_id.clone(), space_root, dir)
                    .with_id(crate::node::NodeId::from(id.as_str())),
                None => RawNode::new(space_id.clone(), space_root, dir),
            };
            metadata.set_multiple(&raw, updates, false).await?;

            Ok(total)
        })
    }
}
