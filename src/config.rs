// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Well-known paths, DBus names, and capability identifiers.

/// Directory holding one id-map file per overlay package, named by
/// [`crate::idmap::idmap_path`]. Typically backed by tmpfs.
pub static IDMAP_CACHE_DIR: &str = "/data/resource-cache/idmap/";

/// Path of the persisted registry document on stable storage. See
/// [`crate::codec`] for the document format.
pub static STATE_FILE_PATH: &str = "/data/system/overlays.xml";

/// DBus service name the daemon advertises.
pub static SERVICE_NAME: &str = "com.example.overlaymanager";

/// DBus object path the [`crate::facade`] interface is served at.
pub static SERVICE_PATH: &str = "/com/example/overlaymanager";

/// Capability required to read another user's overlay state.
pub static CAP_INTERACT_ACROSS_USERS_FULL: &str = "InteractAcrossUsersFull";

/// Capability required to mutate overlay state (enable/disable/reorder).
pub static CAP_CHANGE_CONFIGURATION: &str = "ChangeConfiguration";

/// The user id the core always treats as present and always reconciles
/// first at boot, mirroring the platform's primary/owner account.
pub static BOOT_USER_ID: i64 = 0;

/// Range of uids allotted to a single user account; `userId = uid /
/// PER_USER_RANGE`. Used by [`crate::facade`] to decide whether a caller
/// "owns" the user it is querying without a capability grant.
pub static PER_USER_RANGE: i64 = 100_000;
