//! Backend keeping attributes in xattrs while offloading the unbounded
//! namespaces (`grant.*`, `md.*`) into a MessagePack sidecar sharded by node
//! id once their combined size crosses the offload limit.
//!
//! The `metadata_offloaded` sentinel xattr tells readers which side holds
//! the offloading attributes. Migration order matters: the sidecar must be
//! durable before the sentinel flips, and the duplicate xattrs are removed
//! only after the flip, so a crash at any point leaves a readable state.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{FsError, FsResult};
use crate::layout;
use crate::metadata::messagepack::MessagePackBackend;
use crate::metadata::{
    attribute, composite_write_result, Attributes, LockManager, MetadataBackend, PathIdentity,
    UnlockGuard,
};
use crate::node::MetaNode;

use lru::LruCache;

pub struct HybridBackend {
    locks: Arc<LockManager>,
    offload_limit: usize,
    cache: Mutex<LruCache<String, Arc<Attributes>>>,
}

impl HybridBackend {
    pub fn new(locks: Arc<LockManager>, offload_limit: usize, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            locks,
            offload_limit,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(node: &dyn MetaNode) -> Option<String> {
        if node.id().as_str().is_empty() {
            return None;
        }
        Some(format!("{}!{}", node.space_id(), node.id()))
    }

    fn cache_invalidate(&self, key: &Option<String>) {
        if let Some(key) = key {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop(key);
        }
    }

    fn cache_put(&self, key: Option<String>, attrs: &Arc<Attributes>) {
        if let Some(key) = key {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .put(key, attrs.clone());
        }
    }

    fn cache_get(&self, key: &Option<String>) -> Option<Arc<Attributes>> {
        key.as_ref().and_then(|key| {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
        })
    }

    fn is_offloaded(path: &Path) -> FsResult<bool> {
        Ok(matches!(
            xattr::get(path, attribute::METADATA_OFFLOADED)?.as_deref(),
            Some(b"1")
        ))
    }

    fn read_xattrs(path: &Path) -> FsResult<Attributes> {
        let mut attrs = Attributes::new();
        for name in xattr::list(path)? {
            let Some(key) = name.to_str() else { continue };
            if !key.starts_with(attribute::PREFIX) {
                continue;
            }
            if let Some(value) = xattr::get(path, &name)? {
                attrs.insert(key.to_string(), value);
            }
        }
        Ok(attrs)
    }

    fn load_offloaded(&self, node: &dyn MetaNode) -> FsResult<Attributes> {
        let cache_key = Self::cache_key(node);
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached.as_ref().clone());
        }

        let attrs = Arc::new(MessagePackBackend::load_sidecar(&self.metadata_path(node))?);
        self.cache_put(cache_key, &attrs);
        Ok(attrs.as_ref().clone())
    }

    fn store_offloaded(&self, node: &dyn MetaNode, attrs: Attributes) -> FsResult<()> {
        let sidecar = self.metadata_path(node);
        match MessagePackBackend::store_sidecar(&sidecar, &attrs) {
            Ok(()) => {
                self.cache_put(Self::cache_key(node), &Arc::new(attrs));
                Ok(())
            }
            Err(err) => {
                self.cache_invalidate(&Self::cache_key(node));
                Err(err)
            }
        }
    }

    /// Migrates every offloading attribute into the sidecar and flips the
    /// sentinel. Idempotent when interrupted: the sentinel only flips after
    /// the sidecar is durable, the duplicate xattrs go away after the flip.
    fn migrate(&self, node: &dyn MetaNode, combined: Attributes) -> FsResult<()> {
        debug!(
            node = %node.id(),
            attributes = combined.len(),
            "offloading attribute set crossed the limit, migrating to sidecar"
        );

        self.store_offloaded(node, combined)?;

        let path = node.internal_path();
        xattr::set(path, attribute::METADATA_OFFLOADED, b"1")?;

        for name in xattr::list(path)? {
            let Some(key) = name.to_str() else { continue };
            if attribute::is_offloading_candidate(key) {
                let _ = xattr::remove(path, &name);
            }
        }
        Ok(())
    }

    fn offloading_xattrs(path: &Path) -> FsResult<Attributes> {
        let mut attrs = Attributes::new();
        for name in xattr::list(path)? {
            let Some(key) = name.to_str() else { continue };
            if !attribute::is_offloading_candidate(key) {
                continue;
            }
            if let Some(value) = xattr::get(path, &name)? {
                attrs.insert(key.to_string(), value);
            }
        }
        Ok(attrs)
    }

    fn combined_size(attrs: &Attributes) -> usize {
        attrs
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

#[async_trait]
impl MetadataBackend for HybridBackend {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn get(&self, node: &dyn MetaNode, key: &str) -> FsResult<Vec<u8>> {
        let path = node.internal_path();
        if attribute::is_offloading_candidate(key) && Self::is_offloaded(path)? {
            let offloaded = self.load_offloaded(node)?;
            return offloaded.get(key).cloned().ok_or_else(|| {
                FsError::not_found(format!("attribute {key} at {}", path.display()))
            });
        }

        xattr::get(path, key)?
            .ok_or_else(|| FsError::not_found(format!("attribute {key} at {}", path.display())))
    }

    async fn get_all(&self, node: &dyn MetaNode) -> FsResult<Attributes> {
        let path = node.internal_path();
        let mut attrs = Self::read_xattrs(path)?;

        if Self::is_offloaded(path)? {
            // Sidecar wins for offloading keys that linger as xattrs after
            // an interrupted migration.
            for (key, value) in self.load_offloaded(node)? {
                attrs.insert(key, value);
            }
        }

        Ok(attrs)
    }

    async fn set(&self, node: &dyn MetaNode, key: &str, value: &[u8]) -> FsResult<()> {
        let mut attrs = Attributes::new();
        attrs.insert(key.to_string(), value.to_vec());
        self.set_multiple(node, attrs, true).await
    }

    async fn set_multiple(
        &self,
        node: &dyn MetaNode,
        attrs: Attributes,
        acquire_lock: bool,
    ) -> FsResult<()> {
        let _guard = if acquire_lock {
            Some(self.lock(node).await?)
        } else {
            None
        };

        let path = node.internal_path();
        let attempted = attrs.len();
        let mut failures = Vec::new();

        let (offloading, plain): (Attributes, Attributes) = attrs
            .into_iter()
            .partition(|(key, _)| attribute::is_offloading_candidate(key));

        for (key, value) in plain {
            if let Err(err) = xattr::set(path, &key, &value) {
                failures.push(FsError::Io(err));
            }
        }

        if !offloading.is_empty() {
            let result = if Self::is_offloaded(path)? {
                let mut merged = self.load_offloaded(node)?;
                merged.extend(offloading);
                self.store_offloaded(node, merged)
            } else {
                let mut combined = Self::offloading_xattrs(path)?;
                combined.extend(offloading.clone());

                if Self::combined_size(&combined) > self.offload_limit {
                    self.migrate(node, combined)
                } else {
                    let mut write_failures = Vec::new();
                    for (key, value) in offloading {
                        if let Err(err) = xattr::set(path, &key, &value) {
                            write_failures.push(FsError::Io(err));
                        }
                    }
                    composite_write_result(attempted, write_failures)
                        .map_err(|err| match err {
                            FsError::PartialWrite { first, .. } => *first,
                            other => other,
                        })
                }
            };

            if let Err(err) = result {
                self.cache_invalidate(&Self::cache_key(node));
                failures.push(err);
            }
        }

        composite_write_result(attempted, failures)
    }

    async fn remove(&self, node: &dyn MetaNode, key: &str, acquire_lock: bool) -> FsResult<()> {
        let _guard = if acquire_lock {
            Some(self.lock(node).await?)
        } else {
            None
        };

        let path = node.internal_path();
        if attribute::is_offloading_candidate(key) && Self::is_offloaded(path)? {
            let mut offloaded = self.load_offloaded(node)?;
            offloaded.remove(key);
            return self.store_offloaded(node, offloaded);
        }

        match xattr::remove(path, key) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn lock(&self, node: &dyn MetaNode) -> FsResult<UnlockGuard> {
        self.locks.lock(&self.lockfile_path(node)).await
    }

    async fn purge(&self, node: &dyn MetaNode) -> FsResult<()> {
        self.cache_invalidate(&Self::cache_key(node));

        let path = node.internal_path();
        if path.exists() {
            for name in xattr::list(path)? {
                let Some(key) = name.to_str() else { continue };
                if key.starts_with(attribute::PREFIX) {
                    let _ = xattr::remove(path, &name);
                }
            }
        }

        match std::fs::remove_file(self.metadata_path(node)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, old_node: &dyn MetaNode, new_node: &dyn MetaNode) -> FsResult<()> {
        self.cache_invalidate(&Self::cache_key(old_node));
        self.cache_invalidate(&Self::cache_key(new_node));

        // Xattrs travel with the inode; the sidecar is id-sharded and only
        // moves when the identity changed.
        if old_node.id() == new_node.id() {
            return Ok(());
        }

        let source = self.metadata_path(old_node);
        let target = self.metadata_path(new_node);
        trace!(from = %source.display(), to = %target.display(), "relocating offload sidecar");

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::rename(&source, &target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn identify_path(&self, space_root: &Path, path: &Path) -> FsResult<PathIdentity> {
        let attrs = Self::read_xattrs(path)?;
        let _ = space_root;
        Ok(PathIdentity::from_attrs(&attrs))
    }

    async fn get_all_at(&self, space_root: &Path, path: &Path) -> FsResult<Attributes> {
        let mut attrs = Self::read_xattrs(path)?;

        if Self::is_offloaded(path)? {
            if let Some(id) = attrs
                .get(attribute::ID)
                .and_then(|raw| std::str::from_utf8(raw).ok())
            {
                let shard = layout::shard_path(space_root, id);
                let mut name = shard
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_default();
                name.push(layout::SIDECAR_SUFFIX);
                let sidecar = shard.with_file_name(name);
                for (key, value) in MessagePackBackend::load_sidecar(&sidecar)? {
                    attrs.insert(key, value);
                }
            }
        }

        Ok(attrs)
    }

    fn metadata_path(&self, node: &dyn MetaNode) -> PathBuf {
        if node.id().as_str().is_empty() {
            return MessagePackBackend::sidecar_path(node.internal_path());
        }

        let shard = layout::shard_path(node.space_root(), node.id().as_str());
        let mut name = shard
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(layout::SIDECAR_SUFFIX);
        shard.with_file_name(name)
    }
}
