//! Backend storing every attribute as an extended attribute on the node
//! itself. Metadata travels with the file on rename, which keeps this
//! variant almost stateless; the price is that unbounded attribute sets hit
//! xattr size limits (the hybrid backend exists for that).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::error::{FsError, FsResult};
use crate::metadata::{
    attribute, composite_write_result, Attributes, LockManager, MetadataBackend, PathIdentity,
    UnlockGuard,
};
use crate::node::MetaNode;

pub struct XattrsBackend {
    locks: Arc<LockManager>,
}

impl XattrsBackend {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self { locks }
    }

    fn read_all(path: &Path) -> FsResult<Attributes> {
        let mut attrs = Attributes::new();
        for name in xattr::list(path)? {
            let Some(key) = name.to_str() else { continue };
            if !key.starts_with(attribute::PREFIX) {
                continue;
            }

            match xattr::get(path, &name)? {
                Some(value) => {
                    attrs.insert(key.to_string(), value);
                }
                // A writer removed the attribute between list and get; the
                // caller retries under the lock.
                None => {
                    return Err(FsError::not_found(format!(
                        "attribute {key} vanished at {}",
                        path.display()
                    )))
                }
            }
        }
        Ok(attrs)
    }
}

#[async_trait]
impl MetadataBackend for XattrsBackend {
    fn name(&self) -> &'static str {
        "xattrs"
    }

    async fn get(&self, node: &dyn MetaNode, key: &str) -> FsResult<Vec<u8>> {
        let path = node.internal_path();
        xattr::get(path, key)?.ok_or_else(|| {
            FsError::not_found(format!("attribute {key} at {}", path.display()))
        })
    }

    async fn get_all(&self, node: &dyn MetaNode) -> FsResult<Attributes> {
        let path = node.internal_path();
        match Self::read_all(path) {
            Ok(attrs) => Ok(attrs),
            Err(err) if err.is_not_found() => {
                // Lost the race against a concurrent writer; retry while
                // holding the node's lock.
                trace!(path = %path.display(), "xattr listing raced a writer, retrying locked");
                let _guard = self.lock(node).await?;
                Self::read_all(path)
            }
            Err(err) => Err(err),
        }
    }

    async fn set(&self, node: &dyn MetaNode, key: &str, value: &[u8]) -> FsResult<()> {
        Ok(xattr::set(node.internal_path(), key, value)?)
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
        for (key, value) in attrs {
            if let Err(err) = xattr::set(path, &key, &value) {
                failures.push(FsError::Io(err));
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

        match xattr::remove(node.internal_path(), key) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn lock(&self, node: &dyn MetaNode) -> FsResult<UnlockGuard> {
        self.locks.lock(&self.lockfile_path(node)).await
    }

    async fn purge(&self, node: &dyn MetaNode) -> FsResult<()> {
        let path = node.internal_path();
        if !path.exists() {
            return Ok(());
        }

        for name in xattr::list(path)? {
            let Some(key) = name.to_str() else { continue };
            if key.starts_with(attribute::PREFIX) {
                let _ = xattr::remove(path, &name);
            }
        }
        Ok(())
    }

    async fn rename(&self, _old_node: &dyn MetaNode, _new_node: &dyn MetaNode) -> FsResult<()> {
        // Attributes live on the inode and moved with it.
        Ok(())
    }

    async fn identify_path(&self, space_root: &Path, path: &Path) -> FsResult<PathIdentity> {
        let attrs = self.get_all_at(space_root, path).await?;
        Ok(PathIdentity::from_attrs(&attrs))
    }

    async fn get_all_at(&self, _space_root: &Path, path: &Path) -> FsResult<Attributes> {
        Self::read_all(path)
    }

    fn metadata_path(&self, node: &dyn MetaNode) -> PathBuf {
        node.internal_path().to_path_buf()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{NodeId, RawNode, SpaceId};

    fn fixture() -> (tempfile::TempDir, XattrsBackend, RawNode) {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("report.txt");
        std::fs::write(&target, b"content").unwrap();

        let node = RawNode::new(SpaceId::from("space-1"), dir.path(), &target)
            .with_id(NodeId::from("node-1"));
        let backend = XattrsBackend::new(Arc::new(LockManager::new()));
        (dir, backend, node)
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let (_dir, backend, node) = fixture();

        backend
            .set(&node, attribute::NAME, b"report.txt")
            .await
            .unwrap();
        let value = backend.get(&node, attribute::NAME).await.unwrap();
        assert_eq!(value, b"report.txt");

        let missing = backend.get(&node, attribute::BLOB_ID).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn set_multiple_then_get_all_returns_superset() {
        let (_dir, backend, node) = fixture();

        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), b"node-1".to_vec());
        attrs.insert(attribute::TYPE.into(), b"file".to_vec());
        attrs.insert(attribute::BLOB_SIZE.into(), b"7".to_vec());
        backend.set_multiple(&node, attrs.clone(), true).await.unwrap();

        let all = backend.get_all(&node).await.unwrap();
        for (key, value) in &attrs {
            assert_eq!(all.get(key), Some(value));
        }
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_purge_clears_the_namespace() {
        let (_dir, backend, node) = fixture();

        backend.set(&node, attribute::ID, b"node-1").await.unwrap();
        backend
            .remove(&node, attribute::ID, true)
            .await
            .unwrap();
        backend
            .remove(&node, attribute::ID, true)
            .await
            .unwrap();

        backend.set(&node, attribute::NAME, b"x").await.unwrap();
        backend.set(&node, attribute::TYPE, b"file").await.unwrap();
        backend.purge(&node).await.unwrap();
        assert!(backend.get_all(&node).await.unwrap().is_empty());
    }
}
