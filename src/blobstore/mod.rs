//! # Blobstore
//!
//! Opaque content-addressed storage for file bodies. The engine is
//! blob-storage-agnostic: the live POSIX tree holds the authoritative
//! current content, the blobstore holds the immutable bodies revisions and
//! trash purging refer to. This module is the only writer under the blob
//! directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{FsError, FsResult};
use crate::layout::pathify;

/// The capability set blob operations need from a file node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlobRef {
    pub id: String,
    pub size: u64,
}

impl BlobRef {
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            size,
        }
    }
}

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Blobstore: Send + Sync {
    /// Stores the content of `source` under the blob id. Existing content
    /// for the same id is replaced.
    async fn upload(&self, blob: &BlobRef, source: &Path) -> FsResult<()>;

    async fn download(&self, blob: &BlobRef) -> FsResult<BlobReader>;

    /// Removing an absent blob is a success.
    async fn delete(&self, blob: &BlobRef) -> FsResult<()>;
}

/// Local implementation mapping a blob id to a sharded file path below a
/// dedicated root.
pub struct LocalBlobstore {
    root: PathBuf,
}

impl LocalBlobstore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, blob: &BlobRef) -> PathBuf {
        self.root.join(pathify(&blob.id, 4, 2))
    }
}

#[async_trait]
impl Blobstore for LocalBlobstore {
    async fn upload(&self, blob: &BlobRef, source: &Path) -> FsResult<()> {
        let target = self.blob_path(blob);
        let parent = target.parent().ok_or_else(|| {
            FsError::InvalidReference(format!("blob path {} has no parent", target.display()))
        })?;
        tokio::fs::create_dir_all(parent).await?;

        let staged = tempfile::NamedTempFile::new_in(parent)?;
        tokio::fs::copy(source, staged.path()).await?;
        staged
            .persist(&target)
            .map_err(|persist| FsError::Io(persist.error))?;
        Ok(())
    }

    async fn download(&self, blob: &BlobRef) -> FsResult<BlobReader> {
        let path = self.blob_path(blob);
        let file = tokio::fs::File::open(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                FsError::not_found(format!("blob {}", blob.id))
            } else {
                FsError::Io(err)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, blob: &BlobRef) -> FsResult<()> {
        match tokio::fs::remove_file(self.blob_path(blob)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryBlobstore {
    blobs: std::sync::Mutex<std::collections::HashMap<String, bytes::Bytes>>,
}

impl MemoryBlobstore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Blobstore for MemoryBlobstore {
    async fn upload(&self, blob: &BlobRef, source: &Path) -> FsResult<()> {
        let content = tokio::fs::read(source).await?;
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(blob.id.clone(), bytes::Bytes::from(content));
        Ok(())
    }

    async fn download(&self, blob: &BlobRef) -> FsResult<BlobReader> {
        let content = self
            .blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&blob.id)
            .cloned()
            .ok_or_else(|| FsError::not_found(format!("blob {}", blob.id)))?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn delete(&self, blob: &BlobRef) -> FsResult<()> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&blob.id);
        Ok(())
    }
}
