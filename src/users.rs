//! User mapping seam. When `use_space_groups` is enabled the assimilation
//! workers scope themselves to the group owning a space before touching it;
//! how that mapping happens (setegid, privilege separation, no-op) is the
//! host's concern.

use crate::error::FsResult;

pub trait UserMapper: Send + Sync {
    /// Runs the engine under the given group id until the returned guard is
    /// dropped. Implementations must be safe to call from multiple workers.
    fn scope_to_group(&self, gid: u32) -> FsResult<ScopeGuard>;
}

/// Restores the previous identity on drop.
pub struct ScopeGuard {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl ScopeGuard {
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        Self {
            restore: Some(Box::new(restore)),
        }
    }

    pub fn noop() -> Self {
        Self { restore: None }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

/// Mapper for deployments that run everything under a single identity.
#[derive(Default)]
pub struct NoopUserMapper;

impl UserMapper for NoopUserMapper {
    fn scope_to_group(&self, _gid: u32) -> FsResult<ScopeGuard> {
        Ok(ScopeGuard::noop())
    }
}
