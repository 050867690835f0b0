use std::path::PathBuf;

/// Crate level error taxonomy. Module internal failures are mapped onto these
/// kinds at the boundary so callers can translate them to protocol specific
/// statuses without inspecting error sources.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FsError {
    #[error("no resource matches the reference or key: {0}")]
    NotFound(String),

    #[error("a resource already occupies the target path: {0}")]
    AlreadyExists(String),

    #[error("the permission resolver refused the operation: {0}")]
    PermissionDenied(String),

    #[error("operation is not supported: {0}")]
    NotSupported(&'static str),

    #[error("reference is malformed or escapes the configured root: {0}")]
    InvalidReference(String),

    #[error("node identity clash: {0}")]
    Conflict(String),

    #[error("underlying i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata at {path:?} is corrupt: {detail}")]
    Corruption { path: PathBuf, detail: &'static str },

    #[error("{failed} of {attempted} attribute writes failed, first failure: {first}")]
    PartialWrite {
        attempted: usize,
        failed: usize,
        first: Box<FsError>,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl FsError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// True when the error kind means the target has already reached the
    /// requested absent state, which several trash and revision operations
    /// treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
            || matches!(self, FsError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type FsResult<T> = Result<T, FsError>;
