//! # Tree
//!
//! The thin public surface over the engine: create, list, move, delete,
//! read, upload, metadata, trash and revision operations. Every write
//! acquires the node's metadata lock before touching attributes and routes
//! size and time changes through the propagator.

use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::blobstore::{BlobReader, BlobRef, Blobstore};
use crate::error::{FsError, FsResult};
use crate::events::{Event, EventSink};
use crate::layout;
use crate::lookup::{Lookup, Reference, SpaceType};
use crate::metadata::{attr_u64, attribute, Attributes};
use crate::node::{MetaNode, Node, NodeId, RawNode, SpaceId};
use crate::permissions::PermissionResolver;
use crate::propagator::Propagator;
use crate::revisions::{RevisionEntry, Revisions};
use crate::trashbin::{RecycleItem, Trashbin};
use crate::utils::{checksum_file, disk_mtime, format_timestamp, ContentChecksums};

pub struct Tree {
    lookup: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
    propagator: Arc<dyn Propagator>,
    revisions: Arc<Revisions>,
    trashbin: Arc<Trashbin>,
    permissions: Arc<dyn PermissionResolver>,
    events: Arc<dyn EventSink>,
}

impl Tree {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lookup: Arc<Lookup>,
        blobstore: Arc<dyn Blobstore>,
        propagator: Arc<dyn Propagator>,
        revisions: Arc<Revisions>,
        trashbin: Arc<Trashbin>,
        permissions: Arc<dyn PermissionResolver>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            lookup,
            blobstore,
            propagator,
            revisions,
            trashbin,
            permissions,
            events,
        }
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    /// Creates the on-disk skeleton of a new space (or returns the existing
    /// one for a personal owner) and registers its root node.
    #[instrument(level = tracing::Level::DEBUG, skip(self))]
    pub async fn provision_space(&self, space_type: &SpaceType, name: &str) -> FsResult<Node> {
        let config = self.lookup.config();
        let space_id = self.lookup.generate_space_id(space_type).await?;

        let root = match space_type {
            SpaceType::Personal { username } => config.personal_space_root(username),
            SpaceType::Project => config.project_space_root(space_id.as_str()),
        };

        let root_id = NodeId::from(space_id.as_str());
        if self.lookup.id_cache().get(&space_id, &root_id).await?.is_some() {
            return self.lookup.node_from_id(&space_id, &root_id).await;
        }

        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(layout::locks_dir(&root))?;
        std::fs::create_dir_all(layout::trash_info_dir(&root))?;
        std::fs::create_dir_all(layout::trash_files_dir(&root))?;
        std::fs::create_dir_all(layout::uploads_dir(&root))?;
        std::fs::create_dir_all(layout::indexes_dir(&root))?;
        std::fs::create_dir_all(layout::changes_dir(&root))?;

        let space_kind = match space_type {
            SpaceType::Personal { .. } => "personal",
            SpaceType::Project => "project",
        };

        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), space_id.as_str().as_bytes().to_vec());
        attrs.insert(attribute::TYPE.into(), b"container".to_vec());
        attrs.insert(
            attribute::SPACE_ID.into(),
            space_id.as_str().as_bytes().to_vec(),
        );
        attrs.insert(attribute::SPACE_NAME.into(), name.as_bytes().to_vec());
        attrs.insert(attribute::SPACE_TYPE.into(), space_kind.as_bytes().to_vec());
        attrs.insert(
            attribute::SPACE_ALIAS.into(),
            format!("{space_kind}/{}", name.to_lowercase().replace(' ', "-")).into_bytes(),
        );
        attrs.insert(attribute::PROPAGATION.into(), b"1".to_vec());
        attrs.insert(attribute::TREE_SIZE.into(), b"0".to_vec());
        attrs.insert(
            attribute::MTIME.into(),
            format_timestamp(disk_mtime(&root)?).into_bytes(),
        );

        let raw = RawNode::new(space_id.clone(), &root, &root).with_id(root_id.clone());
        self.lookup
            .metadata()
            .set_multiple(&raw, attrs, false)
            .await?;
        self.lookup.id_cache().set(&space_id, &root_id, &root).await?;

        debug!(%space_id, root = %root.display(), "space provisioned");
        self.lookup.node_from_id(&space_id, &root_id).await
    }

    pub async fn stat(&self, reference: &Reference) -> FsResult<Node> {
        let node = self.lookup.node_from_reference(reference).await?;
        if !self.permissions.can_view(&node) {
            return Err(FsError::PermissionDenied(format!("{}", node.resource_id())));
        }
        Ok(node)
    }

    /// Space-relative path of a node, hiding ancestors the permission
    /// resolver refuses.
    pub async fn path_of(&self, node: &Node) -> FsResult<String> {
        let permissions = self.permissions.clone();
        self.lookup
            .path(node, move |ancestor| permissions.can_view(ancestor))
            .await
    }

    /// Creates an empty file node below the referenced container.
    #[instrument(level = tracing::Level::DEBUG, skip(self, parent_ref))]
    pub async fn touch_file(&self, parent_ref: &Reference, name: &str) -> FsResult<Node> {
        let parent = self.writable_container(parent_ref).await?;
        validate_name(name)?;

        let path = parent.path().join(name);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists(format!("{}", path.display())))
            }
            Err(err) => return Err(err.into()),
        }

        let id = NodeId::generate();
        let raw =
            RawNode::new(parent.space_id().clone(), parent.space_root(), &path).with_id(id.clone());
        let _guard = self.lookup.metadata().lock(&raw).await?;

        let mtime = disk_mtime(&path)?;
        let (checksums, _) = checksum_file(&path)?;
        let attrs = file_attributes(
            &id,
            name,
            parent.id(),
            mtime,
            &uuid::Uuid::new_v4().to_string(),
            0,
            &checksums,
        );
        self.lookup
            .metadata()
            .set_multiple(&raw, attrs, false)
            .await?;
        self.lookup
            .id_cache()
            .set(parent.space_id(), &id, &path)
            .await?;
        self.mark_dirty(&parent).await;

        let node = self.lookup.node_from_id(parent.space_id(), &id).await?;
        self.events
            .publish(Event::FileTouched {
                resource: node.resource_id(),
                parent: Some(parent.resource_id()),
                timestamp: mtime,
            })
            .await;

        self.propagator.propagate(&node, mtime, 0).await?;
        Ok(node)
    }

    /// Creates a container below the referenced container.
    #[instrument(level = tracing::Level::DEBUG, skip(self, parent_ref))]
    pub async fn create_dir(&self, parent_ref: &Reference, name: &str) -> FsResult<Node> {
        let parent = self.writable_container(parent_ref).await?;
        validate_name(name)?;

        let path = parent.path().join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists(format!("{}", path.display())))
            }
            Err(err) => return Err(err.into()),
        }

        let id = NodeId::generate();
        let raw =
            RawNode::new(parent.space_id().clone(), parent.space_root(), &path).with_id(id.clone());
        let _guard = self.lookup.metadata().lock(&raw).await?;

        let mtime = disk_mtime(&path)?;
        let mut attrs = Attributes::new();
        attrs.insert(attribute::ID.into(), id.as_str().as_bytes().to_vec());
        attrs.insert(attribute::NAME.into(), name.as_bytes().to_vec());
        attrs.insert(
            attribute::PARENT_ID.into(),
            parent.id().as_str().as_bytes().to_vec(),
        );
        attrs.insert(attribute::TYPE.into(), b"container".to_vec());
        attrs.insert(attribute::MTIME.into(), format_timestamp(mtime).into_bytes());
        attrs.insert(attribute::TREE_SIZE.into(), b"0".to_vec());
        attrs.insert(attribute::PROPAGATION.into(), b"1".to_vec());

        self.lookup
            .metadata()
            .set_multiple(&raw, attrs, false)
            .await?;
        self.lookup
            .id_cache()
            .set(parent.space_id(), &id, &path)
            .await?;
        self.mark_dirty(&parent).await;

        let node = self.lookup.node_from_id(parent.space_id(), &id).await?;
        self.events
            .publish(Event::ContainerCreated {
                resource: node.resource_id(),
                parent: Some(parent.resource_id()),
                timestamp: mtime,
            })
            .await;

        self.propagator.propagate(&node, mtime, 0).await?;
        Ok(node)
    }

    /// Lists the children of a container with a bounded fan-out, dropping
    /// internal artifacts and nodes the permission resolver hides.
    pub async fn list_folder(&self, reference: &Reference) -> FsResult<Vec<Node>> {
        let node = self.stat(reference).await?;
        if !node.is_container() {
            return Err(FsError::InvalidReference(format!(
                "{} is not a container",
                node.path().display()
            )));
        }

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(node.path())? {
            let entry = entry?;
            let child = entry.path();
            if layout::is_metafile(&child) || layout::is_internal_path(node.space_root(), &child) {
                continue;
            }
            paths.push(child);
        }

        let space_id = node.space_id().clone();
        let space_root = node.space_root().to_path_buf();
        let lookup = self.lookup.clone();

        let children: Vec<Option<Node>> = stream::iter(paths)
            .map(|child| {
                let lookup = lookup.clone();
                let space_id = space_id.clone();
                let space_root = space_root.clone();
                async move {
                    match lookup.metadata().get_all_at(&space_root, &child).await {
                        Ok(attrs) => {
                            Node::from_attributes(space_id, &space_root, &child, &attrs).ok()
                        }
                        Err(err) => {
                            warn!(child = %child.display(), error = %err, "unlistable entry");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.lookup.config().max_concurrency.max(1))
            .collect()
            .await;

        Ok(children
            .into_iter()
            .flatten()
            .filter(|child| self.permissions.can_view(child))
            .collect())
    }

    /// Moves a node to a new parent and/or name within its space. Moves
    /// across spaces are refused as unsupported.
    #[instrument(level = tracing::Level::DEBUG, skip(self, source_ref, destination_ref))]
    pub async fn move_node(
        &self,
        source_ref: &Reference,
        destination_ref: &Reference,
    ) -> FsResult<Node> {
        let source = self.lookup.node_from_reference(source_ref).await?;
        let (new_parent, new_name) = self.resolve_target(destination_ref).await?;

        if source.space_id() != new_parent.space_id() {
            return Err(FsError::NotSupported("cross-space move"));
        }
        if !self.permissions.can_modify(&source) || !self.permissions.can_modify(&new_parent) {
            return Err(FsError::PermissionDenied(format!(
                "{}",
                source.resource_id()
            )));
        }
        validate_name(&new_name)?;
        if source.is_space_root() {
            return Err(FsError::NotSupported("moving a space root"));
        }

        let target = new_parent.path().join(&new_name);
        if target.exists() {
            return Err(FsError::AlreadyExists(format!("{}", target.display())));
        }

        let metadata = self.lookup.metadata();
        let id_cache = self.lookup.id_cache();
        let _guard = metadata.lock(&source).await?;

        let old_path = source.path().to_path_buf();
        let old_parent_id = source.parent_id().cloned();
        let moved_size = self.subtree_size(&source).await;

        // Every reverse entry below the old location becomes invalid.
        id_cache.delete_by_path(&old_path).await?;

        if let Err(err) = std::fs::rename(&old_path, &target) {
            // Best effort restoration of the previous cache state.
            if let Err(restore_err) = id_cache
                .set(source.space_id(), source.id(), &old_path)
                .await
            {
                warn!(error = %restore_err, "cache restoration after failed rename also failed");
            } else if source.is_container() {
                let _ = self
                    .lookup
                    .reindex_subtree(source.space_id(), source.space_root(), &old_path)
                    .await;
            }
            return Err(err.into());
        }

        let raw = RawNode::new(source.space_id().clone(), source.space_root(), &target)
            .with_id(source.id().clone());
        metadata.rename(&source, &raw).await?;

        let mut updates = Attributes::new();
        updates.insert(attribute::NAME.into(), new_name.as_bytes().to_vec());
        updates.insert(
            attribute::PARENT_ID.into(),
            new_parent.id().as_str().as_bytes().to_vec(),
        );
        metadata.set_multiple(&raw, updates, false).await?;

        id_cache.set(source.space_id(), source.id(), &target).await?;
        if source.is_container() {
            self.lookup
                .reindex_subtree(source.space_id(), source.space_root(), &target)
                .await?;
        }

        self.events
            .publish(Event::ItemMoved {
                resource: source.resource_id(),
                old_reference: old_path.to_string_lossy().into_owned(),
                timestamp: OffsetDateTime::now_utc(),
            })
            .await;

        let now = OffsetDateTime::now_utc();
        if let Some(old_parent_id) = old_parent_id {
            if moved_size > 0 {
                let phantom = Node::phantom(
                    source.space_id().clone(),
                    source.space_root(),
                    &old_path,
                    source.id().clone(),
                    old_parent_id,
                );
                if let Err(err) = self
                    .propagator
                    .propagate(&phantom, now, -(moved_size as i64))
                    .await
                {
                    warn!(error = %err, "propagation from the vacated parent failed");
                }
            }
        }

        let moved = self.lookup.node_from_id(source.space_id(), source.id()).await?;
        self.propagator
            .propagate(&moved, now, moved_size as i64)
            .await?;
        self.mark_dirty(&new_parent).await;

        Ok(moved)
    }

    /// Moves a node into the space trash. Returns the recycle key.
    #[instrument(level = tracing::Level::DEBUG, skip(self, reference))]
    pub async fn delete(&self, reference: &Reference) -> FsResult<String> {
        let node = self.lookup.node_from_reference(reference).await?;
        if !self.permissions.can_modify(&node) {
            return Err(FsError::PermissionDenied(format!("{}", node.resource_id())));
        }
        if node.is_space_root() {
            return Err(FsError::NotSupported("deleting a space root"));
        }
        if !self.lookup.config().contains(node.path())
            || !node.path().starts_with(node.space_root())
        {
            return Err(FsError::InvalidReference(format!(
                "{} escapes the configured root",
                node.path().display()
            )));
        }

        let _guard = self.lookup.metadata().lock(&node).await?;

        let size = self.subtree_size(&node).await;
        let parent_id = node.parent_id().cloned();
        let old_path = node.path().to_path_buf();

        let key = self.trashbin.move_to_trash(&node).await?;

        self.events
            .publish(Event::ItemTrashed {
                owner: None,
                executant: None,
                resource: Some(node.resource_id()),
                parent: parent_id
                    .clone()
                    .map(|parent| crate::node::ResourceId::new(node.space_id().clone(), parent)),
                timestamp: OffsetDateTime::now_utc(),
            })
            .await;

        if let Some(parent_id) = parent_id {
            if size > 0 {
                let phantom = Node::phantom(
                    node.space_id().clone(),
                    node.space_root(),
                    &old_path,
                    node.id().clone(),
                    parent_id,
                );
                if let Err(err) = self
                    .propagator
                    .propagate(&phantom, OffsetDateTime::now_utc(), -(size as i64))
                    .await
                {
                    warn!(error = %err, "propagation after delete failed");
                }
            }
        }

        Ok(key)
    }

    /// Opens the current content of a file node.
    pub async fn download(&self, reference: &Reference) -> FsResult<BlobReader> {
        let node = self.stat(reference).await?;
        if node.is_container() {
            return Err(FsError::InvalidReference(format!(
                "{} is a container",
                node.path().display()
            )));
        }

        if node.blob_size() == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        let blob_id = node
            .blob_id()
            .ok_or_else(|| FsError::not_found(format!("blob of {}", node.resource_id())))?;
        self.blobstore
            .download(&BlobRef::new(blob_id, node.blob_size()))
            .await
    }

    /// Finalises an upload: the staged content replaces (or creates) the
    /// node at `name` below the parent; a replaced node's previous state
    /// is captured as a revision first.
    #[instrument(level = tracing::Level::DEBUG, skip(self, parent_ref, staged), fields(staged = %staged.display()))]
    pub async fn finalize_upload(
        &self,
        parent_ref: &Reference,
        name: &str,
        staged: &Path,
    ) -> FsResult<Node> {
        let parent = self.writable_container(parent_ref).await?;
        validate_name(name)?;

        let target = parent.path().join(name);

        let checksum_source = staged.to_path_buf();
        let (checksums, size) =
            tokio::task::spawn_blocking(move || checksum_file(&checksum_source))
                .await
                .map_err(|_| {
                    FsError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "checksum task aborted",
                    ))
                })??;

        let blob_id = uuid::Uuid::new_v4().to_string();
        if size > 0 {
            self.blobstore
                .upload(&BlobRef::new(blob_id.clone(), size), staged)
                .await?;
        }

        if target.exists() {
            let node = self.lookup.node_from_path(&target).await?;
            let _guard = self.lookup.metadata().lock(&node).await?;

            let old_size = node.blob_size();
            self.revisions
                .create_revision(&node, node.mtime().unwrap_or_else(OffsetDateTime::now_utc))
                .await?;

            std::fs::rename(staged, &target)?;
            let mtime = disk_mtime(&target)?;

            let updates = file_attributes(
                node.id(),
                name,
                parent.id(),
                mtime,
                &blob_id,
                size,
                &checksums,
            );
            self.lookup
                .metadata()
                .set_multiple(&node, updates, false)
                .await?;
            self.mark_dirty(&parent).await;

            let refreshed = self.lookup.node_from_id(node.space_id(), node.id()).await?;
            self.events
                .publish(Event::UploadReady {
                    resource: refreshed.resource_id(),
                    parent: Some(parent.resource_id()),
                    timestamp: mtime,
                })
                .await;
            self.propagator
                .propagate(&refreshed, mtime, size as i64 - old_size as i64)
                .await?;
            return Ok(refreshed);
        }

        std::fs::rename(staged, &target)?;
        let mtime = disk_mtime(&target)?;

        let id = NodeId::generate();
        let raw = RawNode::new(parent.space_id().clone(), parent.space_root(), &target)
            .with_id(id.clone());
        let _guard = self.lookup.metadata().lock(&raw).await?;

        let attrs = file_attributes(&id, name, parent.id(), mtime, &blob_id, size, &checksums);
        self.lookup
            .metadata()
            .set_multiple(&raw, attrs, false)
            .await?;
        self.lookup
            .id_cache()
            .set(parent.space_id(), &id, &target)
            .await?;
        self.mark_dirty(&parent).await;

        let node = self.lookup.node_from_id(parent.space_id(), &id).await?;
        self.events
            .publish(Event::UploadReady {
                resource: node.resource_id(),
                parent: Some(parent.resource_id()),
                timestamp: mtime,
            })
            .await;
        self.propagator.propagate(&node, mtime, size as i64).await?;
        Ok(node)
    }

    /// Sets one piece of arbitrary user metadata. Logical keys map into
    /// the reserved namespaces: `tmp.etag`, `quota`, `fav.*`, everything
    /// else lands under `md.*`.
    pub async fn set_metadata(
        &self,
        reference: &Reference,
        key: &str,
        value: &[u8],
    ) -> FsResult<()> {
        let node = self.lookup.node_from_reference(reference).await?;
        if !self.permissions.can_modify(&node) {
            return Err(FsError::PermissionDenied(format!("{}", node.resource_id())));
        }

        let metadata = self.lookup.metadata();
        let _guard = metadata.lock(&node).await?;
        let mut attrs = Attributes::new();
        attrs.insert(metadata_attr_name(key), value.to_vec());
        metadata.set_multiple(&node, attrs, false).await?;

        self.propagator
            .propagate(&node, OffsetDateTime::now_utc(), 0)
            .await
    }

    pub async fn unset_metadata(&self, reference: &Reference, key: &str) -> FsResult<()> {
        let node = self.lookup.node_from_reference(reference).await?;
        if !self.permissions.can_modify(&node) {
            return Err(FsError::PermissionDenied(format!("{}", node.resource_id())));
        }

        self.lookup
            .metadata()
            .remove(&node, &metadata_attr_name(key), true)
            .await
    }

    /// Re-propagates from a node, shifting its subtree account by
    /// `size_diff`.
    pub async fn propagate(&self, reference: &Reference, size_diff: i64) -> FsResult<()> {
        let node = self.lookup.node_from_reference(reference).await?;
        self.propagator
            .propagate(&node, OffsetDateTime::now_utc(), size_diff)
            .await
    }

    // Trash surface.

    pub async fn list_recycle(
        &self,
        space_id: &SpaceId,
        key: &str,
        relative: &str,
    ) -> FsResult<Vec<RecycleItem>> {
        self.trashbin.list_recycle(space_id, key, relative).await
    }

    /// Restores a recycle item and rolls its size back into the target
    /// parent chain.
    pub async fn restore_recycle_item(
        &self,
        space_id: &SpaceId,
        key: &str,
        relative: &str,
        restore_ref: Option<&Reference>,
    ) -> FsResult<Node> {
        let node = self
            .trashbin
            .restore(space_id, key, relative, restore_ref)
            .await?;

        let size = self.subtree_size(&node).await;
        self.propagator
            .propagate(&node, OffsetDateTime::now_utc(), size as i64)
            .await?;
        Ok(node)
    }

    pub async fn purge_recycle_item(
        &self,
        space_id: &SpaceId,
        key: &str,
        relative: &str,
    ) -> FsResult<()> {
        self.trashbin.purge(space_id, key, relative).await
    }

    pub async fn empty_recycle(&self, space_id: &SpaceId) -> FsResult<()> {
        self.trashbin.empty(space_id).await
    }

    // Revision surface.

    pub async fn list_revisions(&self, reference: &Reference) -> FsResult<Vec<RevisionEntry>> {
        self.revisions.list_revisions(reference).await
    }

    pub async fn download_revision(
        &self,
        reference: &Reference,
        key: &str,
    ) -> FsResult<BlobReader> {
        self.revisions.download_revision(reference, key).await
    }

    /// Restores a revision and accounts the resulting size change.
    pub async fn restore_revision(&self, reference: &Reference, key: &str) -> FsResult<()> {
        let before = self.lookup.node_from_reference(reference).await?;
        let old_size = before.blob_size();

        self.revisions.restore_revision(reference, key).await?;

        let after = self.lookup.node_from_reference(reference).await?;
        self.propagator
            .propagate(
                &after,
                OffsetDateTime::now_utc(),
                after.blob_size() as i64 - old_size as i64,
            )
            .await
    }

    pub async fn delete_revision(&self, reference: &Reference, key: &str) -> FsResult<()> {
        self.revisions.delete_revision(reference, key).await
    }

    // Helpers.

    async fn writable_container(&self, reference: &Reference) -> FsResult<Node> {
        let node = self.lookup.node_from_reference(reference).await?;
        if !node.is_container() {
            return Err(FsError::InvalidReference(format!(
                "{} is not a container",
                node.path().display()
            )));
        }
        if !self.permissions.can_modify(&node) {
            return Err(FsError::PermissionDenied(format!("{}", node.resource_id())));
        }
        Ok(node)
    }

    /// Destination references address a (parent, name) pair; the leaf may
    /// not exist yet.
    async fn resolve_target(&self, reference: &Reference) -> FsResult<(Node, String)> {
        match reference {
            Reference::Path(path) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        FsError::InvalidReference(format!("{} has no name", path.display()))
                    })?
                    .to_string();
                let parent_path = path.parent().ok_or_else(|| {
                    FsError::InvalidReference(format!("{} has no parent", path.display()))
                })?;
                let parent = self.lookup.node_from_path(parent_path).await?;
                Ok((parent, name))
            }
            Reference::IdPath { root, relative } => {
                let trimmed = relative.trim_matches('/');
                if trimmed.is_empty() {
                    return Err(FsError::InvalidReference(
                        "destination reference must name a target".to_string(),
                    ));
                }

                let base = self
                    .lookup
                    .node_from_id(&root.space_id, &root.node_id)
                    .await?;
                match trimmed.rsplit_once('/') {
                    Some((dir_part, name)) => {
                        let parent = self
                            .lookup
                            .walk_path(&base, dir_part, true, |_| {})
                            .await?;
                        Ok((parent, name.to_string()))
                    }
                    None => Ok((base, trimmed.to_string())),
                }
            }
            Reference::Id(_) => Err(FsError::InvalidReference(
                "destination reference must include a path".to_string(),
            )),
        }
    }

    async fn subtree_size(&self, node: &Node) -> u64 {
        if node.is_container() {
            self.lookup
                .metadata()
                .get_all(node)
                .await
                .ok()
                .and_then(|attrs| attr_u64(&attrs, attribute::TREE_SIZE))
                .unwrap_or(0)
        } else {
            node.blob_size()
        }
    }

    /// Flags a container for the next dirty-only warm-up pass.
    async fn mark_dirty(&self, container: &Node) {
        if let Err(err) = self
            .lookup
            .metadata()
            .set(container, attribute::DIRTY, b"1")
            .await
        {
            warn!(container = %container.id(), error = %err, "dirty flag not set");
        }
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidReference(format!("node name {name:?}")));
    }
    if layout::is_metafile(Path::new(name)) || layout::is_lock_path(Path::new(name)) {
        return Err(FsError::InvalidReference(format!(
            "node name {name:?} is reserved"
        )));
    }
    Ok(())
}

fn metadata_attr_name(key: &str) -> String {
    match key {
        "tmp.etag" => attribute::TMP_ETAG.to_string(),
        "quota" => attribute::QUOTA.to_string(),
        key if key.starts_with("fav.") => {
            format!("{}{}", attribute::FAVORITE_PREFIX, &key["fav.".len()..])
        }
        key => format!("{}{}", attribute::USER_METADATA_PREFIX, key),
    }
}

fn file_attributes(
    id: &NodeId,
    name: &str,
    parent_id: &NodeId,
    mtime: OffsetDateTime,
    blob_id: &str,
    size: u64,
    checksums: &ContentChecksums,
) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert(attribute::ID.into(), id.as_str().as_bytes().to_vec());
    attrs.insert(attribute::NAME.into(), name.as_bytes().to_vec());
    attrs.insert(
        attribute::PARENT_ID.into(),
        parent_id.as_str().as_bytes().to_vec(),
    );
    attrs.insert(attribute::TYPE.into(), b"file".to_vec());
    attrs.insert(attribute::MTIME.into(), format_timestamp(mtime).into_bytes());
    attrs.insert(attribute::BLOB_ID.into(), blob_id.as_bytes().to_vec());
    attrs.insert(attribute::BLOB_SIZE.into(), size.to_string().into_bytes());
    attrs.insert(
        attribute::CHECKSUM_SHA1.into(),
        checksums.sha1.clone().into_bytes(),
    );
    attrs.insert(
        attribute::CHECKSUM_MD5.into(),
        checksums.md5.clone().into_bytes(),
    );
    attrs.insert(
        attribute::CHECKSUM_ADLER32.into(),
        checksums.adler32.clone().into_bytes(),
    );
    attrs.insert(attribute::SCAN_STATUS.into(), b"unscanned".to_vec());
    attrs
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use crate::blobstore::MemoryBlobstore;
    use crate::config::EngineConfig;
    use crate::events::MemoryEventSink;
    use crate::idcache::IdCache;
    use crate::metadata::{LockManager, MetadataBackend, XattrsBackend};
    use crate::permissions::AllowAll;
    use crate::propagator::SyncPropagator;

    struct Fixture {
        _dir: tempfile::TempDir,
        tree: Tree,
        events: Arc<MemoryEventSink>,
        space: Node,
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

        let blobstore: Arc<dyn Blobstore> = MemoryBlobstore::new();
        let propagator: Arc<dyn Propagator> = Arc::new(SyncPropagator::new(lookup.clone()));
        let revisions = Arc::new(Revisions::new(lookup.clone(), blobstore.clone()));
        let trashbin = Arc::new(Trashbin::new(
            lookup.clone(),
            blobstore.clone(),
            revisions.clone(),
        ));
        let events = MemoryEventSink::new();

        let tree = Tree::new(
            lookup,
            blobstore,
            propagator,
            revisions,
            trashbin,
            Arc::new(AllowAll),
            events.clone(),
        );

        let space = tree
            .provision_space(
                &SpaceType::Personal {
                    username: "marie".into(),
                },
                "Marie",
            )
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            tree,
            events,
            space,
        }
    }

    fn space_ref(fx: &Fixture) -> Reference {
        Reference::id(fx.space.space_id().as_str(), fx.space.id().as_str())
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_for_personal_spaces() {
        let fx = fixture().await;

        let again = fx
            .tree
            .provision_space(
                &SpaceType::Personal {
                    username: "marie".into(),
                },
                "Marie",
            )
            .await
            .unwrap();
        assert_eq!(again.id(), fx.space.id());
        assert!(again.is_space_root());
    }

    #[tokio::test]
    async fn touch_mkdir_list_roundtrip() {
        let fx = fixture().await;
        let root = space_ref(&fx);

        let docs = fx.tree.create_dir(&root, "docs").await.unwrap();
        let file = fx
            .tree
            .touch_file(&Reference::from(docs.resource_id()), "a.txt")
            .await
            .unwrap();
        assert_eq!(file.blob_size(), 0);

        let listed = fx.tree.list_folder(&root).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "docs");

        let inside = fx
            .tree
            .list_folder(&Reference::from(docs.resource_id()))
            .await
            .unwrap();
        assert_eq!(inside.len(), 1);
        assert_eq!(inside[0].id(), file.id());

        let err = fx.tree.create_dir(&root, "docs").await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn upload_roundtrip_with_revision_on_overwrite() {
        let fx = fixture().await;
        let root = space_ref(&fx);

        let staged = fx.space.path().join("uploads/stage-1");
        std::fs::write(&staged, b"v1").unwrap();
        let node = fx
            .tree
            .finalize_upload(&root, "n.txt", &staged)
            .await
            .unwrap();
        assert_eq!(node.blob_size(), 2);

        let staged = fx.space.path().join("uploads/stage-2");
        std::fs::write(&staged, b"v2-longer").unwrap();
        let node = fx
            .tree
            .finalize_upload(&root, "n.txt", &staged)
            .await
            .unwrap();
        assert_eq!(node.blob_size(), 9);

        let reference = Reference::from(node.resource_id());
        let listed = fx.tree.list_revisions(&reference).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2);

        let mut reader = fx.tree.download(&reference).await.unwrap();
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"v2-longer");

        // Root roll-up reflects the live size.
        let space = fx.tree.stat(&root).await.unwrap();
        let attrs = fx
            .tree
            .lookup()
            .metadata()
            .get_all(&space)
            .await
            .unwrap();
        assert_eq!(attr_u64(&attrs, attribute::TREE_SIZE), Some(9));
    }

    #[tokio::test]
    async fn move_within_a_space_keeps_ids_and_rolls_sizes() {
        let fx = fixture().await;
        let root = space_ref(&fx);

        let docs = fx.tree.create_dir(&root, "docs").await.unwrap();
        let archive = fx.tree.create_dir(&root, "archive").await.unwrap();

        let staged = fx.space.path().join("uploads/stage");
        std::fs::write(&staged, b"12345").unwrap();
        let file = fx
            .tree
            .finalize_upload(&Reference::from(docs.resource_id()), "f.txt", &staged)
            .await
            .unwrap();

        let moved = fx
            .tree
            .move_node(
                &Reference::from(file.resource_id()),
                &Reference::relative(
                    fx.space.space_id().as_str(),
                    archive.id().as_str(),
                    "renamed.txt",
                ),
            )
            .await
            .unwrap();
        assert_eq!(moved.id(), file.id());
        assert_eq!(moved.name(), "renamed.txt");
        assert_eq!(moved.parent_id().unwrap(), archive.id());

        let lookup = fx.tree.lookup();
        let docs_attrs = lookup.metadata().get_all(&docs).await.unwrap();
        assert_eq!(attr_u64(&docs_attrs, attribute::TREE_SIZE), Some(0));
        let archive_attrs = lookup.metadata().get_all(&archive).await.unwrap();
        assert_eq!(attr_u64(&archive_attrs, attribute::TREE_SIZE), Some(5));
    }

    #[tokio::test]
    async fn cross_space_moves_are_refused() {
        let fx = fixture().await;
        let other = fx
            .tree
            .provision_space(&SpaceType::Project, "Shared")
            .await
            .unwrap();

        let file = fx.tree.touch_file(&space_ref(&fx), "a.txt").await.unwrap();
        let err = fx
            .tree
            .move_node(
                &Reference::from(file.resource_id()),
                &Reference::relative(
                    other.space_id().as_str(),
                    other.id().as_str(),
                    "a.txt",
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::NotSupported(_)));
    }

    #[tokio::test]
    async fn delete_restores_roundtrip_through_the_trash() {
        let fx = fixture().await;
        let root = space_ref(&fx);
        let space_id = fx.space.space_id().clone();

        let docs = fx.tree.create_dir(&root, "d").await.unwrap();
        let staged = fx.space.path().join("uploads/stage");
        std::fs::write(&staged, b"payload").unwrap();
        let file = fx
            .tree
            .finalize_upload(&Reference::from(docs.resource_id()), "f.txt", &staged)
            .await
            .unwrap();
        let original_id = file.id().clone();
        fx.events.drain();

        let key = fx
            .tree
            .delete(&Reference::from(file.resource_id()))
            .await
            .unwrap();

        let listed = fx.tree.list_recycle(&space_id, "", "").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "d/f.txt");

        let restored = fx
            .tree
            .restore_recycle_item(&space_id, &key, "", None)
            .await
            .unwrap();
        assert_eq!(restored.id(), &original_id);
        assert_eq!(restored.path(), fx.space.path().join("d/f.txt"));

        // Sizes settled back.
        let docs_attrs = fx
            .tree
            .lookup()
            .metadata()
            .get_all(&docs)
            .await
            .unwrap();
        assert_eq!(attr_u64(&docs_attrs, attribute::TREE_SIZE), Some(7));

        let events = fx.events.drain();
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::ItemTrashed { .. })));
    }

    #[tokio::test]
    async fn metadata_surface_maps_logical_keys() {
        let fx = fixture().await;
        let file = fx.tree.touch_file(&space_ref(&fx), "a.txt").await.unwrap();
        let reference = Reference::from(file.resource_id());

        fx.tree
            .set_metadata(&reference, "color", b"teal")
            .await
            .unwrap();
        fx.tree
            .set_metadata(&reference, "tmp.etag", b"\"abc\"")
            .await
            .unwrap();

        let attrs = fx
            .tree
            .lookup()
            .metadata()
            .get_all(&file)
            .await
            .unwrap();
        assert_eq!(
            attrs.get("user.atrium.md.color").map(Vec::as_slice),
            Some(b"teal".as_slice())
        );

        fx.tree.unset_metadata(&reference, "color").await.unwrap();
        let attrs = fx
            .tree
            .lookup()
            .metadata()
            .get_all(&file)
            .await
            .unwrap();
        assert!(!attrs.contains_key("user.atrium.md.color"));
    }
}
