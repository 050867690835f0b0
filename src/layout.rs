//! On-disk layout of a space root. Every component that touches the
//! filesystem goes through these helpers so the layout is defined exactly
//! once.
//!
//! ```text
//! <R>/                              live POSIX tree as users see it
//! <R>/.Trash/info/<id>.trashinfo
//! <R>/.Trash/files/<id>.trashitem
//! <R>/.atrium/locks/<id>.mlock
//! <R>/.atrium/<shard>/<id>[.mpk|.REV.<ts>|.CURRENT.]
//! <R>/changes/<ss>/<space>:<node>/<uuid>.mpk
//! <R>/uploads/
//! <R>/indexes/
//! ```

use std::path::{Path, PathBuf};

pub const METADATA_DIR: &str = ".atrium";
pub const LOCKS_DIR: &str = "locks";
pub const TRASH_DIR: &str = ".Trash";
pub const TRASH_INFO_DIR: &str = "info";
pub const TRASH_FILES_DIR: &str = "files";
pub const UPLOADS_DIR: &str = "uploads";
pub const INDEXES_DIR: &str = "indexes";
pub const CHANGES_DIR: &str = "changes";

pub const TRASH_INFO_SUFFIX: &str = ".trashinfo";
pub const TRASH_ITEM_SUFFIX: &str = ".trashitem";

/// Delimiter between a node id and a revision timestamp.
pub const REVISION_DELIMITER: &str = ".REV.";
/// Suffix marking the current-version sidecar kept by the fs-revisions
/// feature.
pub const CURRENT_MARKER: &str = ".CURRENT.";
/// Delimiter used by legacy flat layouts; recognised, never produced.
pub const LEGACY_TRASH_DELIMITER: &str = ".T.";

pub const LOCK_SUFFIXES: [&str; 3] = [".lock", ".flock", ".mlock"];
pub const METADATA_LOCK_SUFFIX: &str = ".mlock";
pub const SIDECAR_SUFFIX: &str = ".mpk";
pub const PROCESSING_SUFFIX: &str = ".processing";

/// Splits the first `depth * width` characters of `id` by inserting a path
/// separator every `width` characters; the remainder is appended unchanged.
pub fn pathify(id: &str, depth: usize, width: usize) -> String {
    let sharded_len = depth * width;
    if id.len() <= sharded_len {
        return id.to_string();
    }

    let mut out = String::with_capacity(id.len() + depth);
    for (offset, chunk) in id.as_bytes().chunks(width).enumerate() {
        if offset >= depth {
            out.push_str(&id[offset * width..]);
            break;
        }
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('/');
    }
    out
}

pub fn metadata_dir(space_root: &Path) -> PathBuf {
    space_root.join(METADATA_DIR)
}

pub fn locks_dir(space_root: &Path) -> PathBuf {
    metadata_dir(space_root).join(LOCKS_DIR)
}

pub fn trash_dir(space_root: &Path) -> PathBuf {
    space_root.join(TRASH_DIR)
}

pub fn trash_info_dir(space_root: &Path) -> PathBuf {
    trash_dir(space_root).join(TRASH_INFO_DIR)
}

pub fn trash_files_dir(space_root: &Path) -> PathBuf {
    trash_dir(space_root).join(TRASH_FILES_DIR)
}

pub fn uploads_dir(space_root: &Path) -> PathBuf {
    space_root.join(UPLOADS_DIR)
}

pub fn indexes_dir(space_root: &Path) -> PathBuf {
    space_root.join(INDEXES_DIR)
}

pub fn changes_dir(space_root: &Path) -> PathBuf {
    space_root.join(CHANGES_DIR)
}

/// Directory holding the change records for one node of one space.
pub fn change_node_dir(space_root: &Path, space_id: &str, node_id: &str) -> PathBuf {
    let shard = &space_id[..space_id.len().min(2)];
    changes_dir(space_root)
        .join(shard)
        .join(format!("{space_id}:{node_id}"))
}

/// Shard directory a node id's metadata artifacts live in.
pub fn shard_dir(space_root: &Path, id: &str) -> PathBuf {
    let base = base_node_id(id);
    let sharded = pathify(base, 4, 2);
    let prefix = match sharded.rfind('/') {
        Some(cut) => &sharded[..cut],
        None => "",
    };
    metadata_dir(space_root).join(prefix)
}

/// Location of a node id's metadata artifact (`<shard>/<id>`). Revision ids
/// and current markers shard by their base id so they stay adjacent to the
/// live node's metadata.
pub fn shard_path(space_root: &Path, id: &str) -> PathBuf {
    shard_dir(space_root, id).join(id)
}

/// The node id portion of an id that may carry a revision or current-marker
/// suffix.
pub fn base_node_id(id: &str) -> &str {
    if let Some(cut) = id.find(REVISION_DELIMITER) {
        return &id[..cut];
    }
    if let Some(cut) = id.find(CURRENT_MARKER) {
        return &id[..cut];
    }
    if let Some(cut) = id.find(LEGACY_TRASH_DELIMITER) {
        return &id[..cut];
    }
    id
}

pub fn is_lock_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    LOCK_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// True for sidecars, lockfiles, revision bodies and the other artifacts
/// that must never be treated as user content.
pub fn is_metafile(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    is_lock_path(path)
        || name.ends_with(SIDECAR_SUFFIX)
        || name.ends_with(TRASH_INFO_SUFFIX)
        || name.ends_with(PROCESSING_SUFFIX)
        || name.contains(REVISION_DELIMITER)
        || name.contains(CURRENT_MARKER)
}

/// True when `path` lies inside one of the per-space areas the watcher and
/// the listing fan-out must never surface.
pub fn is_internal_path(space_root: &Path, path: &Path) -> bool {
    [
        metadata_dir(space_root),
        trash_dir(space_root),
        uploads_dir(space_root),
        indexes_dir(space_root),
        changes_dir(space_root),
    ]
    .iter()
    .any(|area| path.starts_with(area))
}
