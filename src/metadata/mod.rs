//! # Metadata backends
//!
//! The durable per-node attribute store. Three variants exist with an
//! identical contract: attributes as extended attributes on the node itself
//! ([`XattrsBackend`]), attributes in a MessagePack sidecar
//! ([`MessagePackBackend`]), and a hybrid that keeps hot attributes in
//! xattrs while offloading the unbounded ones (grants, user metadata) into
//! a sharded sidecar once they outgrow a configured limit
//! ([`HybridBackend`]).
//!
//! Every other component goes through this module for attribute I/O; nobody
//! else touches xattrs or sidecars directly.

pub mod attribute;

mod hybrid;
mod lock;
mod messagepack;
mod xattrs;

pub use hybrid::HybridBackend;
pub use lock::{LockManager, UnlockGuard};
pub use messagepack::MessagePackBackend;
pub use xattrs::XattrsBackend;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::config::{EngineConfig, MetadataBackendKind};
use crate::error::{FsError, FsResult};
use crate::layout;
use crate::node::{MetaNode, NodeId, SpaceId};
use crate::utils::parse_timestamp;

/// Attribute map of a single node. Ordered so sidecar encodings are
/// deterministic.
pub type Attributes = BTreeMap<String, Vec<u8>>;

pub fn attr_str<'a>(attrs: &'a Attributes, key: &str) -> Option<&'a str> {
    attrs.get(key).and_then(|raw| std::str::from_utf8(raw).ok())
}

pub fn attr_u64(attrs: &Attributes, key: &str) -> Option<u64> {
    attr_str(attrs, key).and_then(|raw| raw.parse().ok())
}

pub fn attr_time(attrs: &Attributes, key: &str) -> Option<OffsetDateTime> {
    attr_str(attrs, key).and_then(|raw| parse_timestamp(raw).ok())
}

/// What [`MetadataBackend::identify_path`] could learn about a path.
#[derive(Clone, Debug, Default)]
pub struct PathIdentity {
    pub space_id: Option<SpaceId>,
    pub id: Option<NodeId>,
    pub parent_id: Option<NodeId>,
    pub mtime: Option<OffsetDateTime>,
}

impl PathIdentity {
    fn from_attrs(attrs: &Attributes) -> Self {
        Self {
            space_id: attr_str(attrs, attribute::SPACE_ID).map(SpaceId::from),
            id: attr_str(attrs, attribute::ID)
                .filter(|raw| !raw.is_empty())
                .map(NodeId::from),
            parent_id: attr_str(attrs, attribute::PARENT_ID)
                .filter(|raw| !raw.is_empty())
                .map(NodeId::from),
            mtime: attr_time(attrs, attribute::MTIME),
        }
    }
}

/// Durable attribute store for nodes. Writers of multiple attributes must
/// hold the node's metadata lock; single-attribute reads are atomic.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, node: &dyn MetaNode, key: &str) -> FsResult<Vec<u8>>;

    async fn get_all(&self, node: &dyn MetaNode) -> FsResult<Attributes>;

    async fn set(&self, node: &dyn MetaNode, key: &str, value: &[u8]) -> FsResult<()>;

    /// Writes several attributes. Partial failures return a composite error
    /// without rolling back the attributes already written.
    async fn set_multiple(
        &self,
        node: &dyn MetaNode,
        attrs: Attributes,
        acquire_lock: bool,
    ) -> FsResult<()>;

    async fn remove(&self, node: &dyn MetaNode, key: &str, acquire_lock: bool) -> FsResult<()>;

    /// Takes the exclusive metadata lock of the node, blocking concurrent
    /// writers of the same node in and across processes.
    async fn lock(&self, node: &dyn MetaNode) -> FsResult<UnlockGuard>;

    /// Drops every attribute and sidecar belonging to the node.
    async fn purge(&self, node: &dyn MetaNode) -> FsResult<()>;

    /// Relocates backend state when a node's identity or location changed.
    async fn rename(&self, old_node: &dyn MetaNode, new_node: &dyn MetaNode) -> FsResult<()>;

    /// Reads the identity quadruple stored at a bare path, used by the
    /// assimilation pipeline before a [`crate::node::Node`] exists.
    async fn identify_path(&self, space_root: &Path, path: &Path) -> FsResult<PathIdentity>;

    /// Full attribute map stored at a bare path.
    async fn get_all_at(&self, space_root: &Path, path: &Path) -> FsResult<Attributes>;

    /// Where the node's attribute payload lives on disk.
    fn metadata_path(&self, node: &dyn MetaNode) -> PathBuf;

    /// The lockfile serialising writers of this node: the shared per-id
    /// lockfile under the space's lock directory once the node has an id,
    /// an adjacent `.mlock` before that.
    fn lockfile_path(&self, node: &dyn MetaNode) -> PathBuf {
        if node.id().as_str().is_empty() {
            sibling_lockfile(node.internal_path())
        } else {
            layout::locks_dir(node.space_root())
                .join(format!("{}{}", node.id().base(), layout::METADATA_LOCK_SUFFIX))
        }
    }

    fn is_metafile(&self, path: &Path) -> bool {
        layout::is_metafile(path)
    }
}

/// `<path>.mlock` next to the target, for nodes that do not have an id yet.
pub(crate) fn sibling_lockfile(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(layout::METADATA_LOCK_SUFFIX);
    path.with_file_name(name)
}

/// Instantiates the configured backend variant over a shared lock manager.
pub fn backend_from_config(
    config: &EngineConfig,
    locks: Arc<LockManager>,
) -> Arc<dyn MetadataBackend> {
    match config.metadata_backend {
        MetadataBackendKind::Xattrs => Arc::new(XattrsBackend::new(locks)),
        MetadataBackendKind::MessagePack => Arc::new(MessagePackBackend::new(
            locks,
            config.metadata_lru_capacity,
        )),
        MetadataBackendKind::Hybrid => Arc::new(HybridBackend::new(
            locks,
            config.offload_limit,
            config.metadata_lru_capacity,
        )),
    }
}

/// Collects per-attribute write failures into the composite error shape the
/// contract requires.
pub(crate) fn composite_write_result(attempted: usize, failures: Vec<FsError>) -> FsResult<()> {
    if failures.is_empty() {
        return Ok(());
    }

    let failed = failures.len();
    let first = failures
        .into_iter()
        .next()
        .unwrap_or(FsError::NotSupported("empty failure set"));
    Err(FsError::PartialWrite {
        attempted,
        failed,
        first: Box::new(first),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::RawNode;

    #[test]
    fn sibling_lockfile_appends_the_suffix() {
        assert_eq!(
            sibling_lockfile(Path::new("/spaces/alpha/docs/report.txt")),
            PathBuf::from("/spaces/alpha/docs/report.txt.mlock")
        );
    }

    #[test]
    fn lockfile_path_switches_on_identity() {
        let locks = Arc::new(LockManager::new());
        let backend = XattrsBackend::new(locks);

        let unidentified = RawNode::new(
            SpaceId::from("space-1"),
            "/spaces/alpha",
            "/spaces/alpha/docs/report.txt",
        );
        assert_eq!(
            backend.lockfile_path(&unidentified),
            PathBuf::from("/spaces/alpha/docs/report.txt.mlock")
        );

        let identified = unidentified.with_id(NodeId::from("node-1"));
        assert_eq!(
            backend.lockfile_path(&identified),
            PathBuf::from("/spaces/alpha/.atrium/locks/node-1.mlock")
        );
    }

    #[test]
    fn composite_write_result_reports_first_failure() {
        let err = composite_write_result(
            3,
            vec![
                FsError::not_found("a"),
                FsError::NotSupported("b"),
            ],
        )
        .unwrap_err();

        match err {
            FsError::PartialWrite {
                attempted, failed, ..
            } => {
                assert_eq!(attempted, 3);
                assert_eq!(failed, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
