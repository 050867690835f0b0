use std::env;
use std::process::Command;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// The version reported at runtime: the git description when building from
/// a checkout, the crate version when building from a published package.
fn source_version() -> String {
    Command::new("git")
        .args(["describe", "--always", "--dirty", "--tags"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|described| described.trim().to_string())
        .filter(|described| !described.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
}

/// Enabled features, read from the `CARGO_FEATURE_*` variables cargo sets
/// for build scripts, so the reported list never goes stale when the
/// feature set changes.
fn enabled_features() -> String {
    let mut features: Vec<String> = env::vars()
        .filter_map(|(key, _)| {
            key.strip_prefix("CARGO_FEATURE_")
                .map(|name| name.to_lowercase().replace('_', "-"))
        })
        .collect();
    features.sort();

    if features.is_empty() {
        return "none".to_string();
    }
    features.join(",")
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");

    let build_timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    println!("cargo:rustc-env=ATRIUMFS_VERSION={}", source_version());
    println!("cargo:rustc-env=ATRIUMFS_BUILD_TIMESTAMP={build_timestamp}");
    println!(
        "cargo:rustc-env=ATRIUMFS_PROFILE={}",
        env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string())
    );
    println!("cargo:rustc-env=ATRIUMFS_FEATURES={}", enabled_features());
}
