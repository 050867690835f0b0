//! Build identification, stamped by the build script for log preambles and
//! bug reports.

/// The full build identity: source version, build timestamp, profile and
/// enabled features.
pub fn full_version() -> String {
    format!(
        "atriumfs {} ({}, {} build, features: {})",
        env!("ATRIUMFS_VERSION"),
        env!("ATRIUMFS_BUILD_TIMESTAMP"),
        env!("ATRIUMFS_PROFILE"),
        env!("ATRIUMFS_FEATURES"),
    )
}

/// Just the source version, for contexts where a single token is enough.
pub fn minimal_version() -> String {
    format!("atriumfs {}", env!("ATRIUMFS_VERSION"))
}
