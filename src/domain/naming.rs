//! Array-side Name Derivation
//!
//! Every object this orchestrator creates on the array is named from the
//! host-supplied stable identifier, so that handles can always be found
//! again by search without a local mapping table. Replication counterparts
//! on the target array carry a fixed prefix on top of the primary name.

/// Maximum length of a host name on the array
pub const MAX_HOST_NAME_LEN: usize = 32;

const VOLUME_GROUP_PREFIX: &str = "cvg-";
const VOLUME_PREFIX: &str = "cv-";
const SESSION_PREFIX: &str = "ssn-";
const SNAPSHOT_PREFIX: &str = "cs-";
const VIEW_PREFIX: &str = "cview-";
const REPLICATION_PREFIX: &str = "r";

/// Volume group owning the volume with the given id
pub fn volume_group_name(volume_id: &str) -> String {
    format!("{VOLUME_GROUP_PREFIX}{volume_id}")
}

pub fn volume_name(volume_id: &str) -> String {
    format!("{VOLUME_PREFIX}{volume_id}")
}

/// Replication session protecting the volume with the given id
pub fn session_name(volume_id: &str) -> String {
    format!("{SESSION_PREFIX}{volume_id}")
}

pub fn snapshot_name(snapshot_id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{snapshot_id}")
}

/// Transient exposable snapshot used to restore into the given volume
pub fn view_name(volume_id: &str) -> String {
    format!("{VIEW_PREFIX}{volume_id}")
}

/// Name of the target-array counterpart of a primary object
pub fn replication_name(name: &str) -> String {
    format!("{REPLICATION_PREFIX}{name}")
}

/// Sanitize an initiator host name for the array.
///
/// Valid characters are `0-9`, `a-z`, `A-Z`, `-` and `_`; everything else
/// becomes `_`. The result is cut to [`MAX_HOST_NAME_LEN`] characters.
pub fn initiator_host_name(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_HOST_NAME_LEN)
        .collect()
}
