//! inotify-backed producer (via the cross-platform `notify` recommended
//! watcher). Runs on notify's own callback thread and feeds the shared
//! action channel; dropping the watcher ends the stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::watcher::{should_ignore, Action, ActionKind};

pub struct InotifyWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl InotifyWatcher {
    /// Watches `root` recursively, translating raw notifications into
    /// actions on `tx`. Filtered paths are dropped before dispatch.
    pub fn spawn(
        root: &Path,
        config: Arc<EngineConfig>,
        tx: mpsc::Sender<Action>,
    ) -> FsResult<Self> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "watch backend error");
                    return;
                }
            };

            for action in translate(&event) {
                if should_ignore(&config, &action.path) {
                    continue;
                }
                if tx.blocking_send(action).is_err() {
                    // Receiver gone, the engine is shutting down.
                    return;
                }
            }
        })
        .map_err(watch_error)?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        debug!(root = %root.display(), "watching");

        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn watch_error(err: notify::Error) -> FsError {
    FsError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("watch backend failure: {err}"),
    ))
}

fn stat_is_dir(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Maps one raw notification onto zero or more abstract actions.
fn translate(event: &notify::Event) -> Vec<Action> {
    let mut actions = Vec::new();
    let Some(path) = event.paths.first() else {
        return actions;
    };

    match event.kind {
        EventKind::Create(kind) => {
            let is_dir = matches!(kind, CreateKind::Folder) || stat_is_dir(path);
            actions.push(Action::new(ActionKind::Create, is_dir, path));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            actions.push(Action::new(ActionKind::MoveFrom, false, path));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            actions.push(Action::new(ActionKind::Move, stat_is_dir(path), path));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            actions.push(Action::new(ActionKind::MoveFrom, false, path));
            if let Some(target) = event.paths.get(1) {
                actions.push(Action::new(ActionKind::Move, stat_is_dir(target), target));
            }
        }
        EventKind::Modify(_) => {
            actions.push(Action::new(ActionKind::Update, stat_is_dir(path), path));
        }
        EventKind::Remove(kind) => {
            let is_dir = matches!(kind, RemoveKind::Folder);
            actions.push(Action::new(ActionKind::Delete, is_dir, path));
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }

    actions
}
