use std::path::PathBuf;

use crate::node::{NodeId, ResourceId, SpaceId};

/// How callers address a node: by stable identity, by absolute path, or by
/// an identity plus a path relative to it.
#[derive(Clone, Debug)]
pub enum Reference {
    Id(ResourceId),
    Path(PathBuf),
    IdPath { root: ResourceId, relative: String },
}

impl Reference {
    pub fn id(space_id: impl Into<SpaceId>, node_id: impl Into<NodeId>) -> Self {
        Reference::Id(ResourceId::new(space_id.into(), node_id.into()))
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Reference::Path(path.into())
    }

    pub fn relative(
        space_id: impl Into<SpaceId>,
        node_id: impl Into<NodeId>,
        relative: impl Into<String>,
    ) -> Self {
        Reference::IdPath {
            root: ResourceId::new(space_id.into(), node_id.into()),
            relative: relative.into(),
        }
    }

    /// Reference to a path inside the space, rooted at the space root.
    pub fn space_relative(space_id: &SpaceId, relative: impl Into<String>) -> Self {
        Reference::IdPath {
            root: ResourceId::new(space_id.clone(), NodeId::from(space_id.as_str())),
            relative: relative.into(),
        }
    }
}

impl From<ResourceId> for Reference {
    fn from(resource_id: ResourceId) -> Self {
        Reference::Id(resource_id)
    }
}
