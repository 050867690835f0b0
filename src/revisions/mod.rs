//! # Revisions
//!
//! Prior versions of a file node live next to the node's metadata shard
//! under ids of the form `<id>.REV.<rfc3339nano>`. A revision records only
//! the blob-identifying attributes of the node at the time it was
//! superseded; the content itself stays addressable through the blobstore.

use std::path::Path;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{debug, instrument, trace};
use winnow::token::take_till;
use winnow::{PResult, Parser};

use crate::blobstore::{BlobRef, BlobReader, Blobstore};
use crate::error::{FsError, FsResult};
use crate::layout;
use crate::lookup::{Lookup, Reference};
use crate::metadata::{attr_str, attr_u64, attribute, Attributes};
use crate::node::{MetaNode, Node, NodeId, RevisionNode, SpaceId};
use crate::utils::{format_timestamp, parse_timestamp};

/// One listed revision as clients see it.
#[derive(Clone, Debug)]
pub struct RevisionEntry {
    /// Wire format `<node-id>.REV.<rfc3339nano>`.
    pub key: String,
    pub size: u64,
    pub mtime: OffsetDateTime,
    pub etag: String,
}

pub struct Revisions {
    lookup: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
}

impl Revisions {
    pub fn new(lookup: Arc<Lookup>, blobstore: Arc<dyn Blobstore>) -> Self {
        Self { lookup, blobstore }
    }

    /// Captures the current blob-identifying attributes of `node` as a new
    /// revision stamped `version`. The caller must already hold the node's
    /// write lock. Name collisions resolve by a numeric suffix.
    #[instrument(level = tracing::Level::DEBUG, skip(self, node), fields(node = %node.id()))]
    pub async fn create_revision(
        &self,
        node: &Node,
        version: OffsetDateTime,
    ) -> FsResult<NodeId> {
        let metadata = self.lookup.metadata();
        let attrs = metadata.get_all(node).await?;

        let mut revision_attrs = Attributes::new();
        for (key, value) in &attrs {
            if attribute::is_blob_identifying(key) {
                revision_attrs.insert(key.clone(), value.clone());
            }
        }

        let base_key = format!(
            "{}{}{}",
            node.id(),
            layout::REVISION_DELIMITER,
            format_timestamp(version)
        );
        let revision_id = self.unique_revision_id(node, &base_key)?;

        let revision = RevisionNode::new(
            node.space_id().clone(),
            revision_id.clone(),
            node.space_root(),
        );
        if let Some(parent) = revision.internal_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(revision.internal_path())?;

        metadata
            .set_multiple(&revision, revision_attrs, false)
            .await?;

        trace!(revision = %revision_id, "revision created");
        Ok(revision_id)
    }

    fn unique_revision_id(&self, node: &Node, base_key: &str) -> FsResult<NodeId> {
        let candidate = layout::shard_path(node.space_root(), base_key);
        if !candidate.exists() {
            return Ok(NodeId::from(base_key));
        }

        // Pick the next integer above every existing suffix.
        let shard = layout::shard_dir(node.space_root(), base_key);
        let mut next = 1u32;
        for entry in std::fs::read_dir(&shard)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(suffix) = name
                .strip_prefix(base_key)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                if let Ok(n) = suffix.parse::<u32>() {
                    next = next.max(n + 1);
                }
            }
        }

        Ok(NodeId::from(format!("{base_key}.{next}").as_str()))
    }

    /// Lists the revisions of the referenced file, newest first.
    pub async fn list_revisions(&self, reference: &Reference) -> FsResult<Vec<RevisionEntry>> {
        let node = self.lookup.node_from_reference(reference).await?;
        let metadata = self.lookup.metadata();

        let shard = layout::shard_dir(node.space_root(), node.id().as_str());
        let prefix = format!("{}{}", node.id(), layout::REVISION_DELIMITER);

        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&shard) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };

        for entry in dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(&prefix) {
                continue;
            }
            // Sidecars and lockfiles of the revision itself.
            if name.ends_with(layout::SIDECAR_SUFFIX) || layout::is_lock_path(Path::new(&name)) {
                continue;
            }

            let Ok((_, mtime)) = parse_revision_key(&name) else {
                continue;
            };

            let revision = RevisionNode::new(
                node.space_id().clone(),
                NodeId::from(name.as_str()),
                node.space_root(),
            );
            let attrs = metadata.get_all(&revision).await.unwrap_or_default();
            let size = attr_u64(&attrs, attribute::BLOB_SIZE).unwrap_or(0);

            entries.push(RevisionEntry {
                etag: format!("\"{:x}-{size}\"", adler32_of(name.as_bytes())),
                key: name,
                size,
                mtime,
            });
        }

        entries.sort_by(|a, b| b.mtime.cmp(&a.mtime));
        Ok(entries)
    }

    /// Opens the recorded blob of one revision.
    pub async fn download_revision(
        &self,
        reference: &Reference,
        key: &str,
    ) -> FsResult<BlobReader> {
        let node = self.lookup.node_from_reference(reference).await?;
        let revision = self.revision_for_key(&node, key)?;

        let blob = self.revision_blob(&revision).await?;
        self.blobstore.download(&blob).await
    }

    /// Replaces the live node's content and blob-identifying attributes
    /// with those of the given revision. The state being overwritten is
    /// captured as a fresh revision first.
    #[instrument(level = tracing::Level::DEBUG, skip(self, reference))]
    pub async fn restore_revision(&self, reference: &Reference, key: &str) -> FsResult<()> {
        let node = self.lookup.node_from_reference(reference).await?;
        let revision = self.revision_for_key(&node, key)?;

        let metadata = self.lookup.metadata();
        let _guard = metadata.lock(&node).await?;

        // The overwritten state stays reachable as its own revision.
        let overwritten_version = node.mtime().unwrap_or_else(OffsetDateTime::now_utc);
        self.create_revision(&node, overwritten_version).await?;

        let revision_attrs = metadata.get_all(&revision).await?;
        let blob = self.revision_blob(&revision).await?;

        // Restore the canonical POSIX content from the recorded blob.
        let mut reader = self.blobstore.download(&blob).await?;
        let parent = node.path().parent().ok_or_else(|| {
            FsError::InvalidReference(format!("{} has no parent", node.path().display()))
        })?;
        let staged = tempfile::NamedTempFile::new_in(parent)?;
        let mut writer = tokio::fs::File::create(staged.path()).await?;
        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.sync_data().await?;
        drop(writer);
        staged
            .persist(node.path())
            .map_err(|persist| FsError::Io(persist.error))?;

        let mut updates = Attributes::new();
        for (attr_key, value) in &revision_attrs {
            if attribute::is_blob_identifying(attr_key) {
                updates.insert(attr_key.clone(), value.clone());
            }
        }
        updates.insert(
            attribute::MTIME.into(),
            format_timestamp(OffsetDateTime::now_utc()).into_bytes(),
        );
        metadata.set_multiple(&node, updates.clone(), false).await?;

        #[cfg(feature = "fs-revisions")]
        {
            let current_id = format!("{}{}", node.id(), layout::CURRENT_MARKER);
            let current = RevisionNode::new(
                node.space_id().clone(),
                NodeId::from(current_id.as_str()),
                node.space_root(),
            );
            if let Some(parent) = current.internal_path().parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(current.internal_path())?;
            metadata.set_multiple(&current, updates, false).await?;
        }

        debug!(node = %node.id(), key, "revision restored");
        Ok(())
    }

    /// Removes one revision: its file, its metadata, its blob. Absent
    /// revisions are already in the requested state.
    pub async fn delete_revision(&self, reference: &Reference, key: &str) -> FsResult<()> {
        let node = self.lookup.node_from_reference(reference).await?;
        let revision = self.revision_for_key(&node, key)?;

        if !revision.internal_path().exists() {
            return Ok(());
        }

        let blob = self.revision_blob(&revision).await.ok();

        self.lookup.metadata().purge(&revision).await?;
        match std::fs::remove_file(revision.internal_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if let Some(blob) = blob {
            self.blobstore.delete(&blob).await?;
        }
        Ok(())
    }

    /// Drops every revision (and the current marker) of a node. Used when
    /// the node itself is purged from the trash.
    pub(crate) async fn purge_all(
        &self,
        space_id: &SpaceId,
        space_root: &Path,
        node_id: &NodeId,
    ) -> FsResult<()> {
        let shard = layout::shard_dir(space_root, node_id.as_str());
        let revision_prefix = format!("{}{}", node_id, layout::REVISION_DELIMITER);
        let current_prefix = format!("{}{}", node_id, layout::CURRENT_MARKER);

        let dir = match std::fs::read_dir(&shard) {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in dir {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(&revision_prefix) && !name.starts_with(&current_prefix) {
                continue;
            }
            if name.ends_with(layout::SIDECAR_SUFFIX) || layout::is_lock_path(Path::new(&name)) {
                continue;
            }

            let revision = RevisionNode::new(
                space_id.clone(),
                NodeId::from(name.as_str()),
                space_root,
            );
            if let Ok(blob) = self.revision_blob(&revision).await {
                self.blobstore.delete(&blob).await?;
            }
            self.lookup.metadata().purge(&revision).await?;
            let _ = std::fs::remove_file(revision.internal_path());
        }

        Ok(())
    }

    fn revision_for_key(&self, node: &Node, key: &str) -> FsResult<RevisionNode> {
        let (base, _mtime) = parse_revision_key(key)?;
        if base != node.id().as_str() {
            return Err(FsError::not_found(format!("revision {key}")));
        }

        Ok(RevisionNode::new(
            node.space_id().clone(),
            NodeId::from(key),
            node.space_root(),
        ))
    }

    async fn revision_blob(&self, revision: &RevisionNode) -> FsResult<BlobRef> {
        let attrs = self.lookup.metadata().get_all(revision).await?;
        let blob_id = attr_str(&attrs, attribute::BLOB_ID).ok_or_else(|| {
            FsError::Corruption {
                path: revision.internal_path().to_path_buf(),
                detail: "revision lacks a blob id",
            }
        })?;
        let size = attr_u64(&attrs, attribute::BLOB_SIZE).unwrap_or(0);
        Ok(BlobRef::new(blob_id, size))
    }
}

fn adler32_of(data: &[u8]) -> u32 {
    let mut hasher = adler32::RollingAdler32::new();
    hasher.update_buffer(data);
    hasher.hash()
}

fn revision_key_parts<'a>(input: &mut &'a str) -> PResult<(&'a str, &'a str)> {
    let base = take_till(1.., '.').parse_next(input)?;
    layout::REVISION_DELIMITER.parse_next(input)?;
    let timestamp = winnow::combinator::rest.parse_next(input)?;
    Ok((base, timestamp))
}

/// Parses the wire format `<node-id>.REV.<rfc3339nano>[.<n>]`. Anything
/// else is rejected as not found.
pub fn parse_revision_key(key: &str) -> FsResult<(&str, OffsetDateTime)> {
    let mut input = key;
    let (base, timestamp) = revision_key_parts
        .parse_next(&mut input)
        .map_err(|_| FsError::not_found(format!("revision {key}")))?;

    if base.is_empty() || timestamp.is_empty() {
        return Err(FsError::not_found(format!("revision {key}")));
    }

    if let Ok(parsed) = parse_timestamp(timestamp) {
        return Ok((base, parsed));
    }

    // Collision-suffixed keys carry a trailing `.<n>`.
    if let Some((timestamp, suffix)) = timestamp.rsplit_once('.') {
        if suffix.chars().all(|c| c.is_ascii_digit()) && !suffix.is_empty() {
            if let Ok(parsed) = parse_timestamp(timestamp) {
                return Ok((base, parsed));
            }
        }
    }

    Err(FsError::not_found(format!("revision {key}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use crate::blobstore::MemoryBlobstore;
    use crate::config::EngineConfig;
    use crate::idcache::IdCache;
    use crate::metadata::{LockManager, MetadataBackend, XattrsBackend};
    use crate::node::RawNode;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        space_id: SpaceId,
        lookup: Arc<Lookup>,
        blobstore: Arc<MemoryBlobstore>,
        revisions: Revisions,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig::with_root(dir.path()));
        let locks = Arc::new(LockManager::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(XattrsBackend::new(locks));
        let id_cache = Arc::new(
            IdCache::open(&config.id_cache_path(), Duration::from_secs(60)).unwrap(),
        );
        let lookup = Arc::new(Lookup::new(config, metadata, id_cache));

        let space_id = SpaceId::from("space-1");
        let root = dir.path().join("users/marie");
        std::fs::create_dir_all(&root).unwrap();

        // Space root registration.
        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), space_id.as_str().as_bytes().to_vec());
        attrs.insert(attribute::TYPE.into(), b"container".to_vec());
        attrs.insert(
            attribute::SPACE_ID.into(),
            space_id.as_str().as_bytes().to_vec(),
        );
        let root_node =
            RawNode::new(space_id.clone(), &root, &root).with_id(NodeId::from(space_id.as_str()));
        lookup
            .metadata()
            .set_multiple(&root_node, attrs, false)
            .await
            .unwrap();
        lookup
            .id_cache()
            .set(&space_id, &NodeId::from(space_id.as_str()), &root)
            .await
            .unwrap();

        let blobstore = MemoryBlobstore::new();
        let revisions = Revisions::new(lookup.clone(), blobstore.clone());

        Fixture {
            _dir: dir,
            root,
            space_id,
            lookup,
            blobstore,
            revisions,
        }
    }

    /// Writes a file node with content `body` and registers everything the
    /// revision layer relies on.
    async fn seed_file(fx: &Fixture, name: &str, id: &str, body: &[u8]) -> Node {
        let path = fx.root.join(name);
        std::fs::write(&path, body).unwrap();

        let blob_id = format!("blob-{id}-{}", body.len());
        fx.blobstore
            .upload(&BlobRef::new(blob_id.clone(), body.len() as u64), &path)
            .await
            .unwrap();

        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), id.as_bytes().to_vec());
        attrs.insert(attribute::TYPE.into(), b"file".to_vec());
        attrs.insert(
            attribute::PARENT_ID.into(),
            fx.space_id.as_str().as_bytes().to_vec(),
        );
        attrs.insert(attribute::BLOB_ID.into(), blob_id.into_bytes());
        attrs.insert(
            attribute::BLOB_SIZE.into(),
            body.len().to_string().into_bytes(),
        );
        attrs.insert(
            attribute::MTIME.into(),
            format_timestamp(OffsetDateTime::now_utc()).into_bytes(),
        );

        let raw = RawNode::new(fx.space_id.clone(), &fx.root, &path).with_id(NodeId::from(id));
        fx.lookup
            .metadata()
            .set_multiple(&raw, attrs, false)
            .await
            .unwrap();
        fx.lookup
            .id_cache()
            .set(&fx.space_id, &NodeId::from(id), &path)
            .await
            .unwrap();

        fx.lookup
            .node_from_id(&fx.space_id, &NodeId::from(id))
            .await
            .unwrap()
    }

    #[test]
    fn revision_keys_parse_strictly() {
        assert!(parse_revision_key("node-1.REV.2024-05-01T10:00:00Z").is_ok());
        assert!(parse_revision_key("node-1.REV.2024-05-01T10:00:00.123456789Z").is_ok());
        assert!(parse_revision_key("node-1.REV.2024-05-01T10:00:00Z.2").is_ok());

        for bad in [
            "node-1",
            "node-1.REV.",
            ".REV.2024-05-01T10:00:00Z",
            "node-1.REV.yesterday",
            "node-1.T.2024-05-01T10:00:00Z",
        ] {
            assert!(parse_revision_key(bad).is_err(), "{bad} must be rejected");
        }
    }

    #[tokio::test]
    async fn create_list_download_roundtrip() {
        let fx = fixture().await;
        let node = seed_file(&fx, "n.txt", "file-1", b"v1").await;
        let reference = Reference::id(fx.space_id.as_str(), "file-1");

        fx.revisions
            .create_revision(&node, node.mtime().unwrap())
            .await
            .unwrap();

        let listed = fx.revisions.list_revisions(&reference).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2);
        assert!(listed[0].key.contains(".REV."));

        let mut reader = fx
            .revisions
            .download_revision(&reference, &listed[0].key)
            .await
            .unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"v1");
        assert_eq!(body.len() as u64, listed[0].size);
    }

    #[tokio::test]
    async fn restore_swaps_content_and_keeps_the_old_state_as_revision() {
        let fx = fixture().await;

        // v1 exists and is captured as a revision, then v2 replaces it.
        let node_v1 = seed_file(&fx, "n.txt", "file-1", b"v1").await;
        let reference = Reference::id(fx.space_id.as_str(), "file-1");
        fx.revisions
            .create_revision(&node_v1, node_v1.mtime().unwrap())
            .await
            .unwrap();
        seed_file(&fx, "n.txt", "file-1", b"v2-longer").await;

        let listed = fx.revisions.list_revisions(&reference).await.unwrap();
        assert_eq!(listed.len(), 1);

        fx.revisions
            .restore_revision(&reference, &listed[0].key)
            .await
            .unwrap();

        // Live content is v1 again.
        assert_eq!(std::fs::read(fx.root.join("n.txt")).unwrap(), b"v1");
        let node = fx
            .lookup
            .node_from_id(&fx.space_id, &NodeId::from("file-1"))
            .await
            .unwrap();
        assert_eq!(node.blob_size(), 2);

        // The overwritten v2 state became a revision of its own.
        let listed = fx.revisions.list_revisions(&reference).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|entry| entry.size == 9));
    }

    #[tokio::test]
    async fn delete_revision_removes_file_metadata_and_blob() {
        let fx = fixture().await;
        let node = seed_file(&fx, "n.txt", "file-1", b"v1").await;
        let reference = Reference::id(fx.space_id.as_str(), "file-1");

        fx.revisions
            .create_revision(&node, node.mtime().unwrap())
            .await
            .unwrap();
        let listed = fx.revisions.list_revisions(&reference).await.unwrap();
        let key = listed[0].key.clone();

        fx.revisions
            .delete_revision(&reference, &key)
            .await
            .unwrap();
        assert!(fx
            .revisions
            .list_revisions(&reference)
            .await
            .unwrap()
            .is_empty());
        assert!(fx
            .revisions
            .download_revision(&reference, &key)
            .await
            .is_err());

        // Already absent: success.
        fx.revisions
            .delete_revision(&reference, &key)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn colliding_revision_names_get_numeric_suffixes() {
        let fx = fixture().await;
        let node = seed_file(&fx, "n.txt", "file-1", b"v1").await;
        let version = node.mtime().unwrap();

        let first = fx.revisions.create_revision(&node, version).await.unwrap();
        let second = fx.revisions.create_revision(&node, version).await.unwrap();
        let third = fx.revisions.create_revision(&node, version).await.unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert!(second.as_str().ends_with(".1"));
        assert!(third.as_str().ends_with(".2"));
    }
}
