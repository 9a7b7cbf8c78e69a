//! Shared constants.

pub const APP_NAME: &str = "imgpatch";

/// Number of hex characters kept from a SHA-256 digest for snapshot ids.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Suffix appended to the source tag (or used alone for digest references).
pub const DEFAULT_PATCHED_TAG_SUFFIX: &str = "patched";
pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";

/// Directory inside the sandbox where managers write their package listing.
pub const RESULTS_PATH: &str = "/.imgpatch-results";
pub const RESULTS_MANIFEST: &str = "results.manifest";

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Time given to aborted tasks to run their cleanup after the deadline fires.
pub const TIMEOUT_GRACE_SECS: u64 = 1;

pub const STATUS_CHANNEL_CAPACITY: usize = 256;
pub const EXPORT_PIPE_CAPACITY: usize = 64 * 1024;
