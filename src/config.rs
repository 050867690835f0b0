use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Which durable attribute store backs node metadata. The contract is
/// identical across variants, the choice is purely operational.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackendKind {
    Xattrs,
    MessagePack,
    #[default]
    Hybrid,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PropagationMode {
    #[default]
    Sync,
    Async,
}

/// Engine wide configuration. Deserializable so a host can embed it in its
/// own config file; every field carries a production default.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Provider root. Personal spaces live under `users/`, project spaces
    /// under `projects/`.
    pub root: PathBuf,

    pub metadata_backend: MetadataBackendKind,
    pub propagation_mode: PropagationMode,

    /// Roll tree mtimes up to the space root on every mutation.
    pub tree_time_accounting: bool,
    /// Roll tree sizes up to the space root on every mutation.
    pub tree_size_accounting: bool,

    /// Upper bound on concurrently running assimilation workers and on the
    /// directory-listing fan-out.
    pub max_concurrency: usize,

    /// How long the debouncer coalesces events for the same path.
    pub debounce_delay_ms: u64,
    /// Deferral before an async propagation change-directory is processed.
    pub propagation_delay_ms: u64,
    /// Age after which the janitor resumes an abandoned `.processing`
    /// directory.
    pub janitor_grace_ms: u64,
    /// How often the janitor scans for abandoned work.
    pub janitor_interval_ms: u64,

    /// Combined byte size of offloading attributes above which the hybrid
    /// backend migrates them into a sidecar.
    pub offload_limit: usize,

    /// Entries kept in the decoded-metadata LRU.
    pub metadata_lru_capacity: usize,

    /// How long a moved-out path can still yield its former node id.
    pub id_history_ttl_ms: u64,

    /// Switch the effective group to the space owning group before touching
    /// a space (requires a capable [`crate::users::UserMapper`]).
    pub use_space_groups: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/atriumfs"),
            metadata_backend: MetadataBackendKind::default(),
            propagation_mode: PropagationMode::default(),
            tree_time_accounting: true,
            tree_size_accounting: true,
            max_concurrency: 5,
            debounce_delay_ms: 1_000,
            propagation_delay_ms: 5_000,
            janitor_grace_ms: 180_000,
            janitor_interval_ms: 60_000,
            offload_limit: 4_096,
            metadata_lru_capacity: 1_024,
            id_history_ttl_ms: 60_000,
            use_space_groups: false,
        }
    }
}

impl EngineConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn propagation_delay(&self) -> Duration {
        Duration::from_millis(self.propagation_delay_ms)
    }

    pub fn janitor_grace(&self) -> Duration {
        Duration::from_millis(self.janitor_grace_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    pub fn id_history_ttl(&self) -> Duration {
        Duration::from_millis(self.id_history_ttl_ms)
    }

    /// On-disk root of the personal space belonging to `username`. The
    /// template is deterministic so personal space ids survive restarts.
    pub fn personal_space_root(&self, username: &str) -> PathBuf {
        self.root.join("users").join(username)
    }

    pub fn project_space_root(&self, space_id: &str) -> PathBuf {
        self.root.join("projects").join(space_id)
    }

    pub fn blob_root(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn id_cache_path(&self) -> PathBuf {
        self.root.join("idcache.redb")
    }

    /// True when `path` lies inside the configured provider root. Delete and
    /// move refuse to act on anything that escapes it.
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_production_shaped() {
        let config = EngineConfig::default();
        assert_eq!(config.metadata_backend, MetadataBackendKind::Hybrid);
        assert_eq!(config.propagation_mode, PropagationMode::Sync);
        assert!(config.tree_size_accounting);
        assert_eq!(config.janitor_grace(), Duration::from_secs(180));
    }

    #[test]
    fn space_roots_follow_the_templates() {
        let config = EngineConfig::with_root("/srv/atrium");
        assert_eq!(
            config.personal_space_root("marie"),
            PathBuf::from("/srv/atrium/users/marie")
        );
        assert_eq!(
            config.project_space_root("b1946ac9"),
            PathBuf::from("/srv/atrium/projects/b1946ac9")
        );
    }
}
