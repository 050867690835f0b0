//! # Trashbin
//!
//! Per-space recycle area. A deleted node moves (single rename) into
//! `.Trash/files/<id>.trashitem`; a sidecar `.Trash/info/<id>.trashinfo`
//! records its original relative path and deletion time in the classic
//! INI shape. Restores go back to the recorded origin or to an explicit
//! destination; purging also deletes the blobs of every contained file and
//! of all their revisions.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, instrument, warn};
use winnow::token::take_till;
use winnow::{PResult, Parser};

use crate::blobstore::Blobstore;
use crate::error::{FsError, FsResult};
use crate::layout;
use crate::lookup::{Lookup, Reference};
use crate::metadata::{attr_str, attr_u64, attribute, Attributes};
use crate::node::{MetaNode, Node, NodeId, RawNode, SpaceId, TrashNode};
use crate::revisions::Revisions;

const DELETION_DATE_FORMAT: &'static [time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

/// Contents of one `.trashinfo` sidecar.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrashInfo {
    pub path: String,
    pub deletion_date: OffsetDateTime,
}

impl TrashInfo {
    pub fn render(&self) -> String {
        let date = self
            .deletion_date
            .format(DELETION_DATE_FORMAT)
            .unwrap_or_else(|_| String::from("1970-01-01T00:00:00"));
        format!("[Trash Info]\nPath={}\nDeletionDate={}\n", self.path, date)
    }

    pub fn parse(raw: &str) -> FsResult<Self> {
        let mut input = raw;
        trashinfo_body
            .parse_next(&mut input)
            .map_err(|_| FsError::Corruption {
                path: PathBuf::from("trashinfo"),
                detail: "unparseable trashinfo record",
            })
    }
}

fn line_rest<'a>(input: &mut &'a str) -> PResult<&'a str> {
    let value = take_till(0.., ['\n', '\r']).parse_next(input)?;
    let _ = winnow::ascii::line_ending::<_, winnow::error::ContextError>.parse_next(input);
    Ok(value)
}

fn trashinfo_body(input: &mut &str) -> PResult<TrashInfo> {
    "[Trash Info]".parse_next(input)?;
    winnow::ascii::line_ending.parse_next(input)?;
    "Path=".parse_next(input)?;
    let path = line_rest.parse_next(input)?;
    "DeletionDate=".parse_next(input)?;
    let date = line_rest.parse_next(input)?;

    let deletion_date = PrimitiveDateTime::parse(date, DELETION_DATE_FORMAT)
        .map_err(|_| {
            winnow::error::ErrMode::Cut(winnow::error::ContextError::new())
        })?
        .assume_utc();

    Ok(TrashInfo {
        path: path.to_string(),
        deletion_date,
    })
}

/// One listed recycle entry.
#[derive(Clone, Debug)]
pub struct RecycleItem {
    pub key: String,
    /// Original path relative to the space root (joined with the relative
    /// part when listing inside a trashed directory).
    pub path: String,
    pub deletion_date: OffsetDateTime,
    pub size: u64,
    pub is_container: bool,
}

pub struct Trashbin {
    lookup: Arc<Lookup>,
    blobstore: Arc<dyn Blobstore>,
    revisions: Arc<Revisions>,
}

impl Trashbin {
    pub fn new(
        lookup: Arc<Lookup>,
        blobstore: Arc<dyn Blobstore>,
        revisions: Arc<Revisions>,
    ) -> Self {
        Self {
            lookup,
            blobstore,
            revisions,
        }
    }

    fn item_path(space_root: &Path, key: &str, relative: &str) -> PathBuf {
        let root = layout::trash_files_dir(space_root)
            .join(format!("{key}{}", layout::TRASH_ITEM_SUFFIX));
        if relative.trim_matches('/').is_empty() {
            root
        } else {
            root.join(relative.trim_start_matches('/'))
        }
    }

    fn info_path(space_root: &Path, key: &str) -> PathBuf {
        layout::trash_info_dir(space_root)
            .join(format!("{key}{}", layout::TRASH_INFO_SUFFIX))
    }

    /// Relocates a live node into the trash. The caller holds the node's
    /// metadata lock. Returns the recycle key.
    #[instrument(level = tracing::Level::DEBUG, skip(self, node), fields(node = %node.id()))]
    pub async fn move_to_trash(&self, node: &Node) -> FsResult<String> {
        let space_root = node.space_root().to_path_buf();
        std::fs::create_dir_all(layout::trash_info_dir(&space_root))?;
        std::fs::create_dir_all(layout::trash_files_dir(&space_root))?;

        let origin = node
            .path()
            .strip_prefix(&space_root)
            .map_err(|_| {
                FsError::InvalidReference(format!(
                    "{} lies outside its space",
                    node.path().display()
                ))
            })?
            .to_string_lossy()
            .into_owned();

        let key = node.id().to_string();
        let info = TrashInfo {
            path: origin.clone(),
            deletion_date: OffsetDateTime::now_utc(),
        };

        let info_path = Self::info_path(&space_root, &key);
        let mut staged = tempfile::NamedTempFile::new_in(layout::trash_info_dir(&space_root))?;
        staged.write_all(info.render().as_bytes())?;
        staged
            .persist(&info_path)
            .map_err(|persist| FsError::Io(persist.error))?;

        let metadata = self.lookup.metadata();
        let mut origin_attr = Attributes::new();
        origin_attr.insert(attribute::TRASH_ORIGIN.into(), origin.as_bytes().to_vec());
        metadata.set_multiple(node, origin_attr, false).await?;

        // Live index entries for the whole subtree disappear with the node.
        self.lookup.id_cache().delete_by_path(node.path()).await?;

        let target = Self::item_path(&space_root, &key, "");
        std::fs::rename(node.path(), &target)?;

        let trash_node = TrashNode::new(
            node.space_id().clone(),
            node.id().clone(),
            &space_root,
            &target,
        );
        metadata.rename(node, &trash_node).await?;

        debug!(key, origin, "node moved to trash");
        Ok(key)
    }

    /// Three listing modes: the trash top (empty key), one item root
    /// (key only), or the children inside a directory-shaped item.
    pub async fn list_recycle(
        &self,
        space_id: &SpaceId,
        key: &str,
        relative: &str,
    ) -> FsResult<Vec<RecycleItem>> {
        let space_root = self.lookup.space_root(space_id).await?;

        if key.is_empty() {
            let mut items = Vec::new();
            let info_dir = layout::trash_info_dir(&space_root);
            let dir = match std::fs::read_dir(&info_dir) {
                Ok(dir) => dir,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(items),
                Err(err) => return Err(err.into()),
            };

            for entry in dir {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let Some(item_key) = name.strip_suffix(layout::TRASH_INFO_SUFFIX) else {
                    continue;
                };
                match self.item_for(&space_root, item_key, "").await {
                    Ok(item) => items.push(item),
                    Err(err) => {
                        warn!(key = item_key, error = %err, "skipping unreadable trash entry")
                    }
                }
            }
            return Ok(items);
        }

        if relative.trim_matches('/').is_empty() {
            return Ok(vec![self.item_for(&space_root, key, "").await?]);
        }

        let target = Self::item_path(&space_root, key, relative);
        if !target.exists() {
            return Err(FsError::not_found(format!("recycle item {key}/{relative}")));
        }

        if target.is_dir() {
            let mut items = Vec::new();
            for entry in std::fs::read_dir(&target)? {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if layout::is_metafile(&entry.path()) {
                    continue;
                }
                let child_rel = format!("{}/{name}", relative.trim_matches('/'));
                items.push(self.item_for(&space_root, key, &child_rel).await?);
            }
            Ok(items)
        } else {
            Ok(vec![self.item_for(&space_root, key, relative).await?])
        }
    }

    async fn item_for(
        &self,
        space_root: &Path,
        key: &str,
        relative: &str,
    ) -> FsResult<RecycleItem> {
        let info_raw = std::fs::read_to_string(Self::info_path(space_root, key))
            .map_err(|_| FsError::not_found(format!("recycle key {key}")))?;
        let info = TrashInfo::parse(&info_raw)?;

        let item = Self::item_path(space_root, key, relative);
        let meta = std::fs::metadata(&item)
            .map_err(|_| FsError::not_found(format!("recycle item {key}/{relative}")))?;

        let attrs = self
            .lookup
            .metadata()
            .get_all_at(space_root, &item)
            .await
            .unwrap_or_default();

        let size = if meta.is_dir() {
            attr_u64(&attrs, attribute::TREE_SIZE).unwrap_or(0)
        } else {
            attr_u64(&attrs, attribute::BLOB_SIZE).unwrap_or(meta.len())
        };

        let path = if relative.trim_matches('/').is_empty() {
            info.path.clone()
        } else {
            format!("{}/{}", info.path, relative.trim_matches('/'))
        };

        Ok(RecycleItem {
            key: key.to_string(),
            path,
            deletion_date: info.deletion_date,
            size,
            is_container: meta.is_dir(),
        })
    }

    /// Restores an item (or a path inside a directory-shaped item) to its
    /// origin or to an explicit destination reference.
    #[instrument(level = tracing::Level::DEBUG, skip(self, restore_ref))]
    pub async fn restore(
        &self,
        space_id: &SpaceId,
        key: &str,
        relative: &str,
        restore_ref: Option<&Reference>,
    ) -> FsResult<Node> {
        let space_root = self.lookup.space_root(space_id).await?;
        let source = Self::item_path(&space_root, key, relative);
        if !source.exists() {
            return Err(FsError::not_found(format!("recycle item {key}/{relative}")));
        }

        let destination = match restore_ref {
            Some(reference) => self.resolve_destination(reference).await?,
            None => {
                let info_raw = std::fs::read_to_string(Self::info_path(&space_root, key))
                    .map_err(|_| FsError::not_found(format!("recycle key {key}")))?;
                let info = TrashInfo::parse(&info_raw)?;
                let origin = space_root.join(&info.path);
                if relative.trim_matches('/').is_empty() {
                    origin
                } else {
                    origin.join(relative.trim_start_matches('/'))
                }
            }
        };

        if destination.exists() {
            return Err(FsError::AlreadyExists(format!(
                "{}",
                destination.display()
            )));
        }
        let dest_parent = destination.parent().ok_or_else(|| {
            FsError::InvalidReference(format!("{} has no parent", destination.display()))
        })?;
        if !dest_parent.exists() {
            return Err(FsError::not_found(format!(
                "restore destination parent {}",
                dest_parent.display()
            )));
        }

        let metadata = self.lookup.metadata();

        // Identify the node being restored and its new parent.
        let attrs = metadata.get_all_at(&space_root, &source).await?;
        let node_id = attr_str(&attrs, attribute::ID)
            .map(NodeId::from)
            .ok_or_else(|| FsError::Corruption {
                path: source.clone(),
                detail: "trashed item lost its id",
            })?;
        let parent_identity = metadata.identify_path(&space_root, dest_parent).await?;
        let parent_id = if dest_parent == space_root {
            NodeId::from(space_id.as_str())
        } else {
            parent_identity.id.ok_or_else(|| {
                FsError::not_found(format!("unassimilated parent {}", dest_parent.display()))
            })?
        };

        let trash_node = TrashNode::new(space_id.clone(), node_id.clone(), &space_root, &source);
        let mut updates = Attributes::new();
        updates.insert(
            attribute::PARENT_ID.into(),
            parent_id.as_str().as_bytes().to_vec(),
        );
        if let Some(name) = destination.file_name().and_then(|n| n.to_str()) {
            updates.insert(attribute::NAME.into(), name.as_bytes().to_vec());
        }
        metadata.set_multiple(&trash_node, updates, true).await?;
        metadata
            .remove(&trash_node, attribute::TRASH_ORIGIN, false)
            .await?;

        std::fs::rename(&source, &destination)?;

        let restored_raw =
            RawNode::new(space_id.clone(), &space_root, &destination).with_id(node_id.clone());
        metadata.rename(&trash_node, &restored_raw).await?;

        self.lookup
            .id_cache()
            .set(space_id, &node_id, &destination)
            .await?;
        if destination.is_dir() {
            self.lookup
                .reindex_subtree(space_id, &space_root, &destination)
                .await?;
        }

        // The info record only goes away when the trash root is restored.
        if relative.trim_matches('/').is_empty() {
            match std::fs::remove_file(Self::info_path(&space_root, key)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.lookup.node_from_id(space_id, &node_id).await
    }

    async fn resolve_destination(&self, reference: &Reference) -> FsResult<PathBuf> {
        match reference {
            Reference::Path(path) => Ok(path.clone()),
            Reference::Id(resource_id) => Ok(self
                .lookup
                .node_from_id(&resource_id.space_id, &resource_id.node_id)
                .await?
                .path()
                .to_path_buf()),
            Reference::IdPath { root, relative } => {
                let base = self
                    .lookup
                    .node_from_id(&root.space_id, &root.node_id)
                    .await?;
                Ok(base.path().join(relative.trim_start_matches('/')))
            }
        }
    }

    /// Deletes an item (or a path inside it) for good, including the blobs
    /// of every contained file and of all their revisions. Purging an
    /// absent key succeeds.
    #[instrument(level = tracing::Level::DEBUG, skip(self))]
    pub async fn purge(&self, space_id: &SpaceId, key: &str, relative: &str) -> FsResult<()> {
        let space_root = self.lookup.space_root(space_id).await?;
        let target = Self::item_path(&space_root, key, relative);

        if target.exists() {
            self.purge_tree(space_id, &space_root, &target).await?;
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }

        if relative.trim_matches('/').is_empty() {
            match std::fs::remove_file(Self::info_path(&space_root, key)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Deletes blobs, revisions and metadata below `target` (inclusive).
    fn purge_tree<'a>(
        &'a self,
        space_id: &'a SpaceId,
        space_root: &'a Path,
        target: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let attrs = self
                .lookup
                .metadata()
                .get_all_at(space_root, target)
                .await
                .unwrap_or_default();

            if let Some(id) = attr_str(&attrs, attribute::ID).map(NodeId::from) {
                if let Some(blob_id) = attr_str(&attrs, attribute::BLOB_ID) {
                    let size = attr_u64(&attrs, attribute::BLOB_SIZE).unwrap_or(0);
                    self.blobstore
                        .delete(&crate::blobstore::BlobRef::new(blob_id, size))
                        .await?;
                }
                self.revisions
                    .purge_all(space_id, space_root, &id)
                    .await?;

                let raw = RawNode::new(space_id.clone(), space_root, target).with_id(id);
                self.lookup.metadata().purge(&raw).await?;
            }

            if target.is_dir() {
                for entry in std::fs::read_dir(target)? {
                    let entry = entry?;
                    let child = entry.path();
                    if layout::is_metafile(&child) {
                        continue;
                    }
                    self.purge_tree(space_id, space_root, &child).await?;
                }
            }

            Ok(())
        })
    }

    /// Empties the whole trash of a space; blobs and revisions of every
    /// item are deleted as well. Emptying an empty trash is a no-op.
    pub async fn empty(&self, space_id: &SpaceId) -> FsResult<()> {
        let space_root = self.lookup.space_root(space_id).await?;
        let info_dir = layout::trash_info_dir(&space_root);

        if let Ok(dir) = std::fs::read_dir(&info_dir) {
            for entry in dir.flatten() {
                if let Some(key) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(layout::TRASH_INFO_SUFFIX))
                {
                    self.purge(space_id, key, "").await?;
                }
            }
        }

        for dir in [
            layout::trash_files_dir(&space_root),
            layout::trash_info_dir(&space_root),
        ] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}
