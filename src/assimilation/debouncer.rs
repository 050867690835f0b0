//! Per-path event debouncing.
//!
//! Pending items with the same path collapse into one; the recurse flag is
//! sticky. One mutex guards both maps (`pending`, `in_progress`); the
//! schedule phase never executes work under the lock, so timers and workers
//! cannot re-enter it. When a timer fires while a scan for the same path is
//! still running, the item reschedules itself instead of running
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::trace;

/// One unit of assimilation work: a path whose state must be reconciled.
/// Whether that means adopting, updating or purging is decided by the
/// worker from the on-disk state at execution time.
#[derive(Clone, Debug)]
pub struct ScanItem {
    pub path: PathBuf,
    pub recurse: bool,
    pub is_dir_hint: bool,
}

#[derive(Debug, Default)]
struct PendingItem {
    recurse: bool,
    is_dir_hint: bool,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<PathBuf, PendingItem>,
    in_progress: HashSet<PathBuf>,
}

#[derive(Clone)]
pub struct Debouncer {
    delay: Duration,
    state: Arc<Mutex<DebounceState>>,
    tx: mpsc::Sender<ScanItem>,
}

impl Debouncer {
    pub fn new(delay: Duration, tx: mpsc::Sender<ScanItem>) -> Self {
        Self {
            delay,
            state: Arc::new(Mutex::new(DebounceState::default())),
            tx,
        }
    }

    /// Adds or merges a pending item. Only the first enqueue for a path
    /// arms a timer; later ones fold into the pending entry.
    pub fn enqueue(&self, path: impl Into<PathBuf>, recurse: bool, is_dir_hint: bool) {
        let path = path.into();

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pending) = state.pending.get_mut(&path) {
                pending.recurse |= recurse;
                pending.is_dir_hint |= is_dir_hint;
                return;
            }
            state.pending.insert(
                path.clone(),
                PendingItem {
                    recurse,
                    is_dir_hint,
                },
            );
        }

        self.arm(path);
    }

    /// Marks a scan as done so a rescheduled item may run.
    pub fn finished(&self, path: &Path) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_progress
            .remove(path);
    }

    fn arm(&self, path: PathBuf) {
        let debouncer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debouncer.delay).await;
            debouncer.fire(path).await;
        });
    }

    async fn fire(&self, path: PathBuf) {
        let item = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            if state.in_progress.contains(&path) {
                trace!(path = %path.display(), "scan in progress, rescheduling");
                drop(state);
                self.arm(path);
                return;
            }

            let Some(pending) = state.pending.remove(&path) else {
                return;
            };
            state.in_progress.insert(path.clone());

            ScanItem {
                path,
                recurse: pending.recurse,
                is_dir_hint: pending.is_dir_hint,
            }
        };

        if self.tx.send(item.clone()).await.is_err() {
            // Worker pool gone; unblock the path for a later restart.
            self.finished(&item.path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn same_path_items_collapse_and_recurse_is_sticky() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(Duration::from_millis(30), tx);

        for _ in 0..5 {
            debouncer.enqueue("/spaces/s1/a", false, false);
        }
        debouncer.enqueue("/spaces/s1/a", true, true);

        let item = rx.recv().await.unwrap();
        assert_eq!(item.path, PathBuf::from("/spaces/s1/a"));
        assert!(item.recurse);
        assert!(item.is_dir_hint);

        // Nothing else queued.
        assert!(
            tokio::time::timeout(Duration::from_millis(80), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn reschedules_while_a_scan_is_in_progress() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(Duration::from_millis(20), tx);

        debouncer.enqueue("/spaces/s1/a", false, false);
        let first = rx.recv().await.unwrap();

        // The first scan still runs; a new event for the path must wait.
        debouncer.enqueue("/spaces/s1/a", false, false);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "item ran concurrently with the in-progress scan"
        );

        debouncer.finished(&first.path);
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("rescheduled item fired")
            .unwrap();
        assert_eq!(second.path, first.path);
    }
}
