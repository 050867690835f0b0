//! The attribute namespace. Every metadata key the engine writes shares the
//! `user.atrium.` prefix, both as an extended attribute name and as a key
//! inside MessagePack sidecars, so the two storage shapes stay
//! interchangeable.

pub const PREFIX: &str = "user.atrium.";

pub const ID: &str = "user.atrium.id";
pub const PARENT_ID: &str = "user.atrium.parentid";
pub const NAME: &str = "user.atrium.name";
pub const TYPE: &str = "user.atrium.type";
pub const BLOB_ID: &str = "user.atrium.blobid";
pub const BLOB_SIZE: &str = "user.atrium.blobsize";
pub const MTIME: &str = "user.atrium.mtime";
pub const TREE_MTIME: &str = "user.atrium.tmtime";
pub const TREE_SIZE: &str = "user.atrium.treesize";
pub const PROPAGATION: &str = "user.atrium.propagation";
pub const DIRTY: &str = "user.atrium.dirty";

pub const CHECKSUM_PREFIX: &str = "user.atrium.cs.";
pub const CHECKSUM_SHA1: &str = "user.atrium.cs.sha1";
pub const CHECKSUM_MD5: &str = "user.atrium.cs.md5";
pub const CHECKSUM_ADLER32: &str = "user.atrium.cs.adler32";

pub const TRASH_ORIGIN: &str = "user.atrium.trash.origin";

pub const SPACE_ID: &str = "user.atrium.space.id";
pub const SPACE_NAME: &str = "user.atrium.space.name";
pub const SPACE_TYPE: &str = "user.atrium.space.type";
pub const SPACE_DESCRIPTION: &str = "user.atrium.space.description";
pub const SPACE_README: &str = "user.atrium.space.readme";
pub const SPACE_IMAGE: &str = "user.atrium.space.image";
pub const SPACE_ALIAS: &str = "user.atrium.space.alias";
pub const SPACE_TENANT_ID: &str = "user.atrium.space.tenantid";

pub const STATUS: &str = "user.atrium.status";
pub const SCAN_STATUS: &str = "user.atrium.scanstatus";
pub const SCAN_DATE: &str = "user.atrium.scandate";

pub const GRANT_PREFIX: &str = "user.atrium.grant.";
pub const USER_METADATA_PREFIX: &str = "user.atrium.md.";
pub const FAVORITE_PREFIX: &str = "user.atrium.fav.";

pub const REFERENCE: &str = "user.atrium.cs3.ref";
pub const QUOTA: &str = "user.atrium.quota";
pub const TMP_ETAG: &str = "user.atrium.tmp.etag";

/// Sentinel flipped once the offloading attributes of a node have been
/// migrated into their sidecar.
pub const METADATA_OFFLOADED: &str = "user.atrium.metadata_offloaded";

pub const TYPE_FILE: &str = "file";
pub const TYPE_CONTAINER: &str = "container";

/// Keys the hybrid backend may migrate out of xattrs once their combined
/// size crosses the offload limit.
pub fn is_offloading_candidate(key: &str) -> bool {
    key.starts_with(GRANT_PREFIX) || key.starts_with(USER_METADATA_PREFIX)
}

/// The attributes that identify a file's content. Revisions copy exactly
/// this set and nothing else.
pub fn is_blob_identifying(key: &str) -> bool {
    key == TYPE || key == BLOB_ID || key == BLOB_SIZE || key == MTIME || key.starts_with(CHECKSUM_PREFIX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn offloading_covers_grants_and_user_metadata_only() {
        assert!(is_offloading_candidate("user.atrium.grant.u:marie"));
        assert!(is_offloading_candidate("user.atrium.md.color"));
        assert!(!is_offloading_candidate(ID));
        assert!(!is_offloading_candidate(CHECKSUM_SHA1));
    }

    #[test]
    fn blob_identifying_set_matches_the_revision_contract() {
        for key in [TYPE, BLOB_ID, BLOB_SIZE, MTIME, CHECKSUM_SHA1, CHECKSUM_MD5] {
            assert!(is_blob_identifying(key), "{key} must travel with revisions");
        }
        assert!(!is_blob_identifying(NAME));
        assert!(!is_blob_identifying(TREE_SIZE));
    }
}
