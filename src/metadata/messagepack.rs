//! Backend keeping the full attribute map of a node in a single MessagePack
//! sidecar next to the node. Writes go through a temp file and an atomic
//! rename; a small in-process LRU caches decoded maps keyed by
//! `(space_id, id)`.

use std::io::Write;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lru::LruCache;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::layout;
use crate::metadata::{
    Attributes, LockManager, MetadataBackend, PathIdentity, UnlockGuard,
};
use crate::node::MetaNode;

pub struct MessagePackBackend {
    locks: Arc<LockManager>,
    cache: Mutex<LruCache<String, Arc<Attributes>>>,
}

impl MessagePackBackend {
    pub fn new(locks: Arc<LockManager>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            locks,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(node: &dyn MetaNode) -> Option<String> {
        if node.id().as_str().is_empty() {
            return None;
        }
        Some(format!("{}!{}", node.space_id(), node.id()))
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

    fn cache_invalidate(&self, key: &Option<String>) {
        if let Some(key) = key {
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop(key);
        }
    }

    pub(crate) fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(layout::SIDECAR_SUFFIX);
        path.with_file_name(name)
    }

    /// Decodes the sidecar at `sidecar`. A missing file is an empty map, an
    /// existing but unparseable or empty file is corruption.
    pub(crate) fn load_sidecar(sidecar: &Path) -> FsResult<Attributes> {
        let payload = match std::fs::read(sidecar) {
            Ok(payload) => payload,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Attributes::new())
            }
            Err(err) => return Err(err.into()),
        };

        if payload.is_empty() {
            return Err(FsError::Corruption {
                path: sidecar.to_path_buf(),
                detail: "sidecar exists but is empty",
            });
        }

        rmp_serde::from_slice(&payload).map_err(|_| FsError::Corruption {
            path: sidecar.to_path_buf(),
            detail: "sidecar is not a messagepack attribute map",
        })
    }

    /// Encodes and atomically replaces the sidecar.
    pub(crate) fn store_sidecar(sidecar: &Path, attrs: &Attributes) -> FsResult<()> {
        let payload = rmp_serde::to_vec(attrs).map_err(|_| FsError::Corruption {
            path: sidecar.to_path_buf(),
            detail: "attribute map failed to encode",
        })?;

        let parent = sidecar.parent().ok_or_else(|| {
            FsError::InvalidReference(format!("sidecar {} has no parent", sidecar.display()))
        })?;
        std::fs::create_dir_all(parent)?;

        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        staged.write_all(&payload)?;
        staged.as_file().sync_data()?;
        staged
            .persist(sidecar)
            .map_err(|persist| FsError::Io(persist.error))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataBackend for MessagePackBackend {
    fn name(&self) -> &'static str {
        "messagepack"
    }

    async fn get(&self, node: &dyn MetaNode, key: &str) -> FsResult<Vec<u8>> {
        let all = self.get_all(node).await?;
        all.get(key).cloned().ok_or_else(|| {
            FsError::not_found(format!(
                "attribute {key} at {}",
                node.internal_path().display()
            ))
        })
    }

    async fn get_all(&self, node: &dyn MetaNode) -> FsResult<Attributes> {
        let cache_key = Self::cache_key(node);
        if let Some(cached) = self.cache_get(&cache_key) {
            return Ok(cached.as_ref().clone());
        }

        let attrs = Arc::new(Self::load_sidecar(&self.metadata_path(node))?);
        self.cache_put(cache_key, &attrs);
        Ok(attrs.as_ref().clone())
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

        let cache_key = Self::cache_key(node);
        let sidecar = self.metadata_path(node);

        let result = (|| {
            let mut merged = Self::load_sidecar(&sidecar)?;
            for (key, value) in &attrs {
                merged.insert(key.clone(), value.clone());
            }
            Self::store_sidecar(&sidecar, &merged)?;
            Ok::<Attributes, FsError>(merged)
        })();

        match result {
            Ok(merged) => {
                self.cache_put(cache_key, &Arc::new(merged));
                Ok(())
            }
            Err(err) => {
                self.cache_invalidate(&cache_key);
                Err(err)
            }
        }
    }

    async fn remove(&self, node: &dyn MetaNode, key: &str, acquire_lock: bool) -> FsResult<()> {
        let _guard = if acquire_lock {
            Some(self.lock(node).await?)
        } else {
            None
        };

        let cache_key = Self::cache_key(node);
        let sidecar = self.metadata_path(node);

        let result = (|| {
            let mut merged = Self::load_sidecar(&sidecar)?;
            merged.remove(key);
            Self::store_sidecar(&sidecar, &merged)?;
            Ok::<Attributes, FsError>(merged)
        })();

        match result {
            Ok(merged) => {
                self.cache_put(cache_key, &Arc::new(merged));
                Ok(())
            }
            Err(err) => {
                self.cache_invalidate(&cache_key);
                Err(err)
            }
        }
    }

    async fn lock(&self, node: &dyn MetaNode) -> FsResult<UnlockGuard> {
        self.locks.lock(&self.lockfile_path(node)).await
    }

    async fn purge(&self, node: &dyn MetaNode) -> FsResult<()> {
        self.cache_invalidate(&Self::cache_key(node));
        match std::fs::remove_file(self.metadata_path(node)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, old_node: &dyn MetaNode, new_node: &dyn MetaNode) -> FsResult<()> {
        self.cache_invalidate(&Self::cache_key(old_node));
        self.cache_invalidate(&Self::cache_key(new_node));

        let source = self.metadata_path(old_node);
        let target = self.metadata_path(new_node);
        if source == target {
            return Ok(());
        }

        trace!(from = %source.display(), to = %target.display(), "relocating sidecar");
        match std::fs::rename(&source, &target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn identify_path(&self, space_root: &Path, path: &Path) -> FsResult<PathIdentity> {
        let attrs = self.get_all_at(space_root, path).await?;
        Ok(PathIdentity::from_attrs(&attrs))
    }

    async fn get_all_at(&self, _space_root: &Path, path: &Path) -> FsResult<Attributes> {
        Self::load_sidecar(&Self::sidecar_path(path))
    }

    fn metadata_path(&self, node: &dyn MetaNode) -> PathBuf {
        Self::sidecar_path(node.internal_path())
    }
}
