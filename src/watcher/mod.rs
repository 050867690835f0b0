//! # Watcher
//!
//! Normalises filesystem event sources into one abstract action stream.
//! Every backend (inotify here; CephFS MDS notifications, GPFS watch
//! folders or audit logs elsewhere) is a separate producer feeding the same
//! bounded channel; the assimilation pipeline only ever sees
//! `(action, is_dir, absolute_path)` triples.
//!
//! Events for lock suffixes and for paths inside the per-space internal
//! areas (metadata, trash, uploads, indexes, changes) are dropped before
//! dispatch.

mod inotify;

pub use inotify::InotifyWatcher;

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::layout;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActionKind {
    Create,
    Update,
    Move,
    MoveFrom,
    Delete,
}

#[derive(Clone, Debug)]
pub struct Action {
    pub kind: ActionKind,
    pub is_dir: bool,
    pub path: PathBuf,
}

impl Action {
    pub fn new(kind: ActionKind, is_dir: bool, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            is_dir,
            path: path.into(),
        }
    }
}

/// The space root owning `path`, derived from the provider layout
/// (`<root>/users/<name>` and `<root>/projects/<id>`).
pub fn space_root_of(config: &EngineConfig, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(&config.root).ok()?;
    let mut components = relative.components();

    let area = components.next()?.as_os_str();
    if area != "users" && area != "projects" {
        return None;
    }
    let name = components.next()?.as_os_str();

    Some(config.root.join(area).join(name))
}

/// True when the watcher must drop the event before dispatch.
pub fn should_ignore(config: &EngineConfig, path: &Path) -> bool {
    if layout::is_lock_path(path) {
        return true;
    }

    match space_root_of(config, path) {
        Some(space_root) => layout::is_internal_path(&space_root, path),
        // Paths outside any space (the provider root itself, the blob
        // area, the id cache) are never assimilated.
        None => true,
    }
}
