//! Per-node metadata locking.
//!
//! Two layers: an in-process intent mutex keyed by lockfile path (so two
//! tasks in the same process never race on the same advisory lock), and an
//! `flock` on the lockfile itself for cross-process exclusion. The guard
//! releases both when dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{FsError, FsResult};

#[derive(Default)]
pub struct LockManager {
    intents: Mutex<HashMap<PathBuf, Weak<AsyncMutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn intent(&self, lockfile: &Path) -> Arc<AsyncMutex<()>> {
        let mut intents = self
            .intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        intents.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = intents.get(lockfile).and_then(Weak::upgrade) {
            return existing;
        }

        let fresh = Arc::new(AsyncMutex::new(()));
        intents.insert(lockfile.to_path_buf(), Arc::downgrade(&fresh));
        fresh
    }

    /// Acquires the exclusive lock backed by `lockfile`, creating the file
    /// and its parent directories as needed. Blocks until both the
    /// in-process intent and the advisory file lock are held.
    pub async fn lock(&self, lockfile: &Path) -> FsResult<UnlockGuard> {
        let intent = self.intent(lockfile).lock_owned().await;

        let target = lockfile.to_path_buf();
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .map_err(|_| {
            FsError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "lock acquisition task aborted",
            ))
        })??;

        Ok(UnlockGuard {
            _intent: intent,
            file: Some(file),
        })
    }
}

/// Held while a writer owns a node's metadata lock; releases the advisory
/// lock and the in-process intent on drop.
pub struct UnlockGuard {
    _intent: OwnedMutexGuard<()>,
    file: Option<std::fs::File>,
}

impl Drop for UnlockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

impl std::fmt::Debug for UnlockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockGuard").finish_non_exhaustive()
    }
}
