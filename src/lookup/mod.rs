//! # Lookup
//!
//! Resolves references into live nodes, walks paths segment by segment,
//! shards ids onto disk and manages space identities. Lookup owns the
//! handles to the metadata backend and the id cache; every component that
//! needs either reaches them through here so sharing stays explicit.

mod reference;

pub use reference::Reference;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::idcache::IdCache;
use crate::layout;
use crate::metadata::{attr_str, attribute, MetadataBackend};
use crate::node::{MetaNode, Node, NodeId, SpaceId};

pub use crate::layout::pathify;

/// Kinds of spaces the engine provisions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SpaceType {
    /// Owned by a single user; its id is stable across restarts because it
    /// derives from the deterministic owner path.
    Personal { username: String },
    Project,
}

pub struct Lookup {
    config: Arc<EngineConfig>,
    metadata: Arc<dyn MetadataBackend>,
    id_cache: Arc<IdCache>,
}

impl Lookup {
    pub fn new(
        config: Arc<EngineConfig>,
        metadata: Arc<dyn MetadataBackend>,
        id_cache: Arc<IdCache>,
    ) -> Self {
        Self {
            config,
            metadata,
            id_cache,
        }
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataBackend> {
        &self.metadata
    }

    pub fn id_cache(&self) -> &Arc<IdCache> {
        &self.id_cache
    }

    /// Root directory of a space, resolved through the id cache entry the
    /// space registered for its own id.
    pub async fn space_root(&self, space_id: &SpaceId) -> FsResult<PathBuf> {
        self.id_cache
            .get(space_id, &NodeId::from(space_id.as_str()))
            .await?
            .ok_or_else(|| FsError::not_found(format!("space {space_id}")))
    }

    /// Resolves any reference shape into a live node.
    pub async fn node_from_reference(&self, reference: &Reference) -> FsResult<Node> {
        match reference {
            Reference::Id(resource_id) => {
                self.node_from_id(&resource_id.space_id, &resource_id.node_id)
                    .await
            }
            Reference::IdPath { root, relative } => {
                let base = self.node_from_id(&root.space_id, &root.node_id).await?;
                if relative.trim_matches('/').is_empty() {
                    return Ok(base);
                }
                self.walk_path(&base, relative, true, |_| {}).await
            }
            Reference::Path(path) => self.node_from_path(path).await,
        }
    }

    /// Resolves a stable identity. `id == space` addresses the space root.
    pub async fn node_from_id(&self, space_id: &SpaceId, node_id: &NodeId) -> FsResult<Node> {
        if node_id.is_revision() || node_id.is_current_marker() {
            return Err(FsError::InvalidReference(format!(
                "{node_id} does not address a live node"
            )));
        }

        let path = self
            .id_cache
            .get(space_id, node_id)
            .await?
            .ok_or_else(|| FsError::not_found(format!("{space_id}!{node_id}")))?;

        let space_root = self.space_root(space_id).await?;
        let attrs = self.metadata.get_all_at(&space_root, &path).await?;
        Node::from_attributes(space_id.clone(), space_root, path, &attrs)
    }

    /// Resolves an absolute path, preferring the reverse index and falling
    /// back to on-disk identification for nodes the cache missed.
    pub async fn node_from_path(&self, path: &Path) -> FsResult<Node> {
        if !self.config.contains(path) {
            return Err(FsError::InvalidReference(format!(
                "{} escapes the configured root",
                path.display()
            )));
        }

        if let Some((space_id, node_id)) = self.id_cache.get_by_path(path).await? {
            return self.node_from_id(&space_id, &node_id).await;
        }

        trace!(path = %path.display(), "reverse index miss, identifying on disk");
        let space_root = self
            .find_space_root(path)
            .await?
            .ok_or_else(|| FsError::not_found(format!("no space above {}", path.display())))?;
        let space_id = self.space_id_of_root(&space_root).await?;

        let attrs = self.metadata.get_all_at(&space_root, path).await?;
        Node::from_attributes(space_id, space_root, path, &attrs)
    }

    /// Walks upward from `path` to the first ancestor carrying a space id
    /// attribute. Returns `None` when the walk leaves the configured root.
    pub async fn find_space_root(&self, path: &Path) -> FsResult<Option<PathBuf>> {
        let mut current = Some(path.to_path_buf());
        while let Some(candidate) = current {
            if !self.config.contains(&candidate) {
                return Ok(None);
            }

            match self
                .metadata
                .identify_path(&candidate, &candidate)
                .await
            {
                Ok(identity) if identity.space_id.is_some() => return Ok(Some(candidate)),
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }

            current = candidate.parent().map(Path::to_path_buf);
        }
        Ok(None)
    }

    pub async fn space_id_of_root(&self, space_root: &Path) -> FsResult<SpaceId> {
        let identity = self
            .metadata
            .identify_path(space_root, space_root)
            .await?;
        identity
            .space_id
            .ok_or_else(|| FsError::not_found(format!("space id at {}", space_root.display())))
    }

    /// Descends from `root` segment by segment. With `follow_refs` set, a
    /// node carrying a reference attribute is resolved to its target before
    /// the walk continues. `visit` observes every intermediate node.
    pub async fn walk_path<F>(
        &self,
        root: &Node,
        relative: &str,
        follow_refs: bool,
        mut visit: F,
    ) -> FsResult<Node>
    where
        F: FnMut(&Node) + Send,
    {
        let mut current = root.clone();

        for segment in relative.split('/').filter(|segment| !segment.is_empty()) {
            if segment == "." || segment == ".." {
                return Err(FsError::InvalidReference(format!(
                    "traversal segment {segment:?} in {relative:?}"
                )));
            }

            if !current.is_container() {
                return Err(FsError::not_found(format!(
                    "{} is not a container",
                    current.path().display()
                )));
            }

            let child_path = current.path().join(segment);
            let attrs = self
                .metadata
                .get_all_at(current.space_root(), &child_path)
                .await
                .map_err(|err| {
                    if err.is_not_found() {
                        FsError::not_found(format!("{} does not exist", child_path.display()))
                    } else {
                        err
                    }
                })?;

            let mut child = Node::from_attributes(
                current.space_id().clone(),
                current.space_root(),
                &child_path,
                &attrs,
            )?;

            if follow_refs {
                if let Some(target) = attr_str(&attrs, attribute::REFERENCE) {
                    let (space, node) = target.split_once('!').ok_or_else(|| {
                        FsError::InvalidReference(format!("reference attribute {target:?}"))
                    })?;
                    child = Box::pin(self.node_from_id(
                        &SpaceId::from(space),
                        &NodeId::from(node),
                    ))
                    .await?;
                }
            }

            visit(&child);
            current = child;
        }

        Ok(current)
    }

    /// Builds the space-relative path of a node by walking to the space
    /// root. Upward traversal stops when `permission_fn` rejects an
    /// ancestor, hiding everything above it.
    pub async fn path<F>(&self, node: &Node, mut permission_fn: F) -> FsResult<String>
    where
        F: FnMut(&Node) -> bool + Send,
    {
        if node.is_space_root() {
            return Ok("/".to_string());
        }

        let mut segments = vec![node.name().to_string()];
        let mut current = node.clone();

        while let Some(parent_id) = current.parent_id().cloned() {
            let parent = self.node_from_id(node.space_id(), &parent_id).await?;
            if parent.is_space_root() {
                break;
            }
            if !permission_fn(&parent) {
                break;
            }
            segments.push(parent.name().to_string());
            current = parent;
        }

        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// On-disk location of an id. Live nodes come from the id cache;
    /// revision ids and current markers map into the sharded metadata area
    /// of the space.
    pub async fn internal_path(&self, space_id: &SpaceId, node_id: &NodeId) -> FsResult<PathBuf> {
        if node_id.is_revision() || node_id.is_current_marker() {
            let space_root = self.space_root(space_id).await?;
            return Ok(layout::shard_path(&space_root, node_id.as_str()));
        }

        self.id_cache
            .get(space_id, node_id)
            .await?
            .ok_or_else(|| FsError::not_found(format!("{space_id}!{node_id}")))
    }

    /// Re-registers the reverse index for every identified descendant of
    /// `dir`; used after a subtree relocated wholesale (moves, restores).
    pub(crate) fn reindex_subtree<'a>(
        &'a self,
        space_id: &'a SpaceId,
        space_root: &'a Path,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = FsResult<()>> + Send + 'a>> {
        Box::pin(async move {
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                let child = entry.path();
                if layout::is_metafile(&child) || layout::is_internal_path(space_root, &child) {
                    continue;
                }

                let attrs = self
                    .metadata
                    .get_all_at(space_root, &child)
                    .await
                    .unwrap_or_default();
                if let Some(id) = attr_str(&attrs, attribute::ID) {
                    self.id_cache
                        .set(space_id, &NodeId::from(id), &child)
                        .await?;
                }

                if entry.file_type()?.is_dir() {
                    self.reindex_subtree(space_id, space_root, &child).await?;
                }
            }
            Ok(())
        })
    }

    /// Space id for a new or existing space. Project spaces always get a
    /// fresh UUID; personal spaces reuse the id registered for the
    /// deterministic owner path when one exists.
    pub async fn generate_space_id(&self, space_type: &SpaceType) -> FsResult<SpaceId> {
        match space_type {
            SpaceType::Project => Ok(SpaceId::generate()),
            SpaceType::Personal { username } => {
                let root = self.config.personal_space_root(username);
                match self.id_cache.get_by_path(&root).await? {
                    Some((space_id, _)) => Ok(space_id),
                    None => Ok(SpaceId::generate()),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::{Attributes, LockManager, XattrsBackend};
    use crate::node::RawNode;
    use std::time::Duration;

    async fn fixture() -> (tempfile::TempDir, Arc<Lookup>) {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig::with_root(dir.path()));
        let locks = Arc::new(LockManager::new());
        let metadata: Arc<dyn MetadataBackend> = Arc::new(XattrsBackend::new(locks));
        let id_cache = Arc::new(
            IdCache::open(&config.id_cache_path(), Duration::from_secs(60)).unwrap(),
        );
        let lookup = Arc::new(Lookup::new(config, metadata, id_cache));
        (dir, lookup)
    }

    /// Lays a tiny space on disk by hand: root, one directory, one file.
    async fn seed_space(lookup: &Lookup, root: &Path) -> SpaceId {
        let space_id = SpaceId::from("11112222-3333-4444-5555-666677778888");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("docs/report.txt"), b"12345").unwrap();

        let nodes: [(&str, &str, &str, Option<&str>); 3] = [
            ("", space_id.as_str(), "container", None),
            ("docs", "dir-1", "container", Some(space_id.as_str())),
            ("docs/report.txt", "file-1", "file", Some("dir-1")),
        ];

        for (rel, id, kind, parent) in nodes {
            let path = if rel.is_empty() {
                root.to_path_buf()
            } else {
                root.join(rel)
            };
            let mut attrs = Attributes::new();
            attrs.insert(attribute::ID.into(), id.as_bytes().to_vec());
            attrs.insert(attribute::TYPE.into(), kind.as_bytes().to_vec());
            if let Some(parent) = parent {
                attrs.insert(attribute::PARENT_ID.into(), parent.as_bytes().to_vec());
            }
            if rel.is_empty() {
                attrs.insert(attribute::SPACE_ID.into(), space_id.as_str().as_bytes().to_vec());
            }

            let node = RawNode::new(space_id.clone(), root, &path).with_id(NodeId::from(id));
            lookup
                .metadata()
                .set_multiple(&node, attrs, false)
                .await
                .unwrap();
            lookup
                .id_cache()
                .set(&space_id, &NodeId::from(id), &path)
                .await
                .unwrap();
        }

        space_id
    }

    #[tokio::test]
    async fn resolves_ids_paths_and_relative_references() {
        let (dir, lookup) = fixture().await;
        let root = dir.path().join("users/marie");
        std::fs::create_dir_all(&root).unwrap();
        let space_id = seed_space(&lookup, &root).await;

        let by_id = lookup
            .node_from_reference(&Reference::id(space_id.as_str(), "file-1"))
            .await
            .unwrap();
        assert_eq!(by_id.name(), "report.txt");

        let by_path = lookup
            .node_from_reference(&Reference::path(root.join("docs/report.txt")))
            .await
            .unwrap();
        assert_eq!(by_path.id().as_str(), "file-1");

        let by_walk = lookup
            .node_from_reference(&Reference::space_relative(&space_id, "/docs/report.txt"))
            .await
            .unwrap();
        assert_eq!(by_walk.id().as_str(), "file-1");
        assert_eq!(by_walk.parent_id().unwrap().as_str(), "dir-1");
    }

    #[tokio::test]
    async fn path_walks_to_the_space_root_and_honours_permissions() {
        let (dir, lookup) = fixture().await;
        let root = dir.path().join("users/marie");
        std::fs::create_dir_all(&root).unwrap();
        let space_id = seed_space(&lookup, &root).await;

        let file = lookup
            .node_from_id(&space_id, &NodeId::from("file-1"))
            .await
            .unwrap();

        let full = lookup.path(&file, |_| true).await.unwrap();
        assert_eq!(full, "/docs/report.txt");

        // Hiding the ancestor truncates the path at the file itself.
        let truncated = lookup.path(&file, |_| false).await.unwrap();
        assert_eq!(truncated, "/report.txt");
    }

    #[tokio::test]
    async fn internal_path_shards_revision_ids() {
        let (dir, lookup) = fixture().await;
        let root = dir.path().join("users/marie");
        std::fs::create_dir_all(&root).unwrap();
        let space_id = seed_space(&lookup, &root).await;

        let revision = NodeId::from("file-1.REV.2024-05-01T10:00:00Z");
        let path = lookup.internal_path(&space_id, &revision).await.unwrap();
        assert!(path.starts_with(layout::metadata_dir(&root)));
        assert!(path
            .to_string_lossy()
            .ends_with("file-1.REV.2024-05-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn personal_space_ids_are_stable_project_ids_are_fresh() {
        let (dir, lookup) = fixture().await;
        let root = dir.path().join("users/marie");
        std::fs::create_dir_all(&root).unwrap();
        let space_id = seed_space(&lookup, &root).await;

        let personal = SpaceType::Personal {
            username: "marie".into(),
        };
        assert_eq!(lookup.generate_space_id(&personal).await.unwrap(), space_id);

        let one = lookup.generate_space_id(&SpaceType::Project).await.unwrap();
        let two = lookup.generate_space_id(&SpaceType::Project).await.unwrap();
        assert_ne!(one, two);
    }
}
