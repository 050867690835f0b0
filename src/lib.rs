//! # atriumfs
//!
//! A multi-tenant, hierarchical file-storage engine on top of a local
//! POSIX filesystem. Files and directories are addressed both by their
//! human path and by a stable opaque node id, so renames and moves never
//! change a resource's identity. Content lives at the canonical POSIX
//! location users see; every node carries a side-band of metadata
//! (identity, checksums, sizes, tree roll-ups, trash and version
//! bookkeeping) maintained by the engine.
//!
//! External POSIX mutations are picked up by the watcher, debounced, and
//! adopted into the id space by the assimilation pipeline. Client
//! operations go through the [`tree::Tree`] surface. The collaborator
//! seams ([`permissions::PermissionResolver`], [`blobstore::Blobstore`],
//! [`events::EventSink`], [`users::UserMapper`]) keep protocol frontends,
//! blob backends and event buses out of the core.

pub mod assimilation;
pub mod blobstore;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod idcache;
pub mod layout;
pub mod lookup;
pub mod metadata;
pub mod metrics;
pub mod node;
pub mod permissions;
pub mod propagator;
pub mod revisions;
pub mod trashbin;
pub mod tree;
pub mod users;
pub mod utils;
pub mod version;
pub mod watcher;

pub mod prelude {
    pub use crate::config::{EngineConfig, MetadataBackendKind, PropagationMode};
    pub use crate::engine::{SpaceEngine, SpaceEngineBuilder};
    pub use crate::error::{FsError, FsResult};
    pub use crate::events::{Event, EventSink};
    pub use crate::lookup::{Reference, SpaceType};
    pub use crate::node::{Node, NodeId, NodeType, ResourceId, SpaceId};
    pub use crate::tree::Tree;
    pub use crate::version::full_version;
}
