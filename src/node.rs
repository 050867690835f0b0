//! The logical node model.
//!
//! A node is a file or container with a stable opaque id and a side-band of
//! metadata. The engine deliberately keeps no in-memory node table: the
//! authoritative state lives in the metadata backend and the id cache, and
//! the value types here are lightweight handles pointing at it.
//!
//! The metadata and revision layers only ever need the capability set
//! `{space_id, id, internal_path}` from a node, expressed by [`MetaNode`].
//! Three variants implement it: a live [`Node`], a [`TrashNode`] relocated
//! under the space trash, and a [`RevisionNode`] adjacent to the live node's
//! metadata shard.

use std::fmt;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{FsError, FsResult};
use crate::layout;
use crate::metadata::{attr_str, attr_u64, attribute, Attributes};
use crate::utils::parse_timestamp;

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SpaceId(String);

impl SpaceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Opaque, stable node identifier. Revision ids embed the `.REV.` delimiter
/// and shard next to their base node's metadata.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_revision(&self) -> bool {
        self.0.contains(layout::REVISION_DELIMITER)
    }

    pub fn is_current_marker(&self) -> bool {
        self.0.contains(layout::CURRENT_MARKER)
    }

    /// The live node id this id belongs to, with any revision or marker
    /// suffix stripped.
    pub fn base(&self) -> &str {
        layout::base_node_id(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    pub space_id: SpaceId,
    pub node_id: NodeId,
}

impl ResourceId {
    pub fn new(space_id: SpaceId, node_id: NodeId) -> Self {
        Self { space_id, node_id }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.space_id, self.node_id)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeType {
    File,
    Container,
}

impl NodeType {
    pub fn as_attr(&self) -> &'static str {
        match self {
            NodeType::File => attribute::TYPE_FILE,
            NodeType::Container => attribute::TYPE_CONTAINER,
        }
    }

    pub fn from_attr(raw: &[u8]) -> Option<Self> {
        match raw {
            b"file" => Some(NodeType::File),
            b"container" => Some(NodeType::Container),
            _ => None,
        }
    }
}

/// Capability set the metadata and revision layers require from any node
/// variant.
pub trait MetaNode: Send + Sync {
    fn space_id(&self) -> &SpaceId;

    fn id(&self) -> &NodeId;

    /// Root directory of the space the node belongs to.
    fn space_root(&self) -> &Path;

    /// The on-disk location metadata is attached to: the live path for live
    /// nodes, the trash item for trashed ones, the metadata shard for
    /// revisions.
    fn internal_path(&self) -> &Path;
}

/// A live node, resolved from a reference or discovered by assimilation.
#[derive(Clone, Debug)]
pub struct Node {
    space_id: SpaceId,
    id: NodeId,
    parent_id: Option<NodeId>,
    name: String,
    space_root: PathBuf,
    path: PathBuf,
    kind: NodeType,
    blob_id: Option<String>,
    blob_size: u64,
    mtime: Option<OffsetDateTime>,
}

impl Node {
    /// Builds a node from the attribute map stored at `path`. The id and
    /// type attributes are required; everything else degrades gracefully.
    pub fn from_attributes(
        space_id: SpaceId,
        space_root: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
        attrs: &Attributes,
    ) -> FsResult<Self> {
        let path = path.into();

        let id = attr_str(attrs, attribute::ID)
            .map(NodeId::from)
            .ok_or_else(|| FsError::not_found(format!("no node id at {}", path.display())))?;

        let kind = attrs
            .get(attribute::TYPE)
            .and_then(|raw| NodeType::from_attr(raw))
            .ok_or(FsError::Corruption {
                path: path.clone(),
                detail: "node type attribute missing or unknown",
            })?;

        let name = attr_str(attrs, attribute::NAME)
            .map(str::to_string)
            .or_else(|| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();

        let parent_id = attr_str(attrs, attribute::PARENT_ID)
            .filter(|raw| !raw.is_empty())
            .map(NodeId::from);

        let mtime = attr_str(attrs, attribute::MTIME).and_then(|raw| parse_timestamp(raw).ok());

        Ok(Self {
            space_id,
            id,
            parent_id,
            name,
            space_root: space_root.into(),
            path,
            kind,
            blob_id: attr_str(attrs, attribute::BLOB_ID).map(str::to_string),
            blob_size: attr_u64(attrs, attribute::BLOB_SIZE).unwrap_or_default(),
            mtime,
        })
    }

    /// Minimal stand-in for a node at a location that can no longer be
    /// resolved from disk (vacated by a move or delete), carrying just
    /// enough state to drive propagation along its old parent chain.
    pub(crate) fn phantom(
        space_id: SpaceId,
        space_root: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
        id: NodeId,
        parent_id: NodeId,
    ) -> Self {
        let path = path.into();
        Self {
            space_id,
            id,
            parent_id: Some(parent_id),
            name: path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string(),
            space_root: space_root.into(),
            path,
            kind: NodeType::File,
            blob_id: None,
            blob_size: 0,
            mtime: None,
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.space_id.clone(), self.id.clone())
    }

    pub fn parent_id(&self) -> Option<&NodeId> {
        self.parent_id.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeType {
        self.kind
    }

    pub fn is_container(&self) -> bool {
        self.kind == NodeType::Container
    }

    pub fn is_space_root(&self) -> bool {
        self.id.as_str() == self.space_id.as_str()
    }

    pub fn blob_id(&self) -> Option<&str> {
        self.blob_id.as_deref()
    }

    pub fn blob_size(&self) -> u64 {
        self.blob_size
    }

    pub fn mtime(&self) -> Option<OffsetDateTime> {
        self.mtime
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetaNode for Node {
    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn space_root(&self) -> &Path {
        &self.space_root
    }

    fn internal_path(&self) -> &Path {
        &self.path
    }
}

/// A node relocated under the space trash area.
#[derive(Clone, Debug)]
pub struct TrashNode {
    space_id: SpaceId,
    id: NodeId,
    space_root: PathBuf,
    path: PathBuf,
}

impl TrashNode {
    pub fn new(
        space_id: SpaceId,
        id: NodeId,
        space_root: impl Into<PathBuf>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            space_id,
            id,
            space_root: space_root.into(),
            path: path.into(),
        }
    }
}

impl MetaNode for TrashNode {
    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn space_root(&self) -> &Path {
        &self.space_root
    }

    fn internal_path(&self) -> &Path {
        &self.path
    }
}

/// A prior version of a file node, living next to the live node's metadata
/// shard under an id of the form `<base>.REV.<rfc3339nano>`.
#[derive(Clone, Debug)]
pub struct RevisionNode {
    space_id: SpaceId,
    id: NodeId,
    space_root: PathBuf,
    path: PathBuf,
}

impl RevisionNode {
    pub fn new(space_id: SpaceId, id: NodeId, space_root: impl Into<PathBuf>) -> Self {
        let space_root = space_root.into();
        let path = layout::shard_path(&space_root, id.as_str());
        Self {
            space_id,
            id,
            space_root,
            path,
        }
    }
}

impl MetaNode for RevisionNode {
    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn space_root(&self) -> &Path {
        &self.space_root
    }

    fn internal_path(&self) -> &Path {
        &self.path
    }
}

/// Ad-hoc metadata handle for a path that may not carry an id yet, used by
/// the assimilation pipeline before identity is established.
#[derive(Clone, Debug)]
pub struct RawNode {
    space_id: SpaceId,
    id: NodeId,
    space_root: PathBuf,
    path: PathBuf,
}

impl RawNode {
    pub fn new(space_id: SpaceId, space_root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            space_id,
            id: NodeId::new(""),
            space_root: space_root.into(),
            path: path.into(),
        }
    }

    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }
}

impl MetaNode for RawNode {
    fn space_id(&self) -> &SpaceId {
        &self.space_id
    }

    fn id(&self) -> &NodeId {
        &self.id
    }

    fn space_root(&self) -> &Path {
        &self.space_root
    }

    fn internal_path(&self) -> &Path {
        &self.path
    }
}
