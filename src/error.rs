// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the overlay manager daemon.
//!
//! This module defines the `OverlayError` enum, which represents all possible
//! error conditions raised by the registry, rules engine, id-map lifecycle,
//! state codec and package driver. Each variant carries enough context
//! (paths, the offending value) to be useful in logs without a caller having
//! to reconstruct it.
//!
//! # DBus Integration
//!
//! Errors are automatically converted to `zbus::fdo::Error` types for
//! transmission over DBus. The error message always includes the
//! `OverlayError::<variant>:` prefix to allow callers to distinguish between
//! application errors and DBus communication errors.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use overlaymanagerd::error::OverlayError;
//! # use std::path::Path;
//! #
//! fn read_state(path: &Path) -> Result<String, OverlayError> {
//!     // Will produce: OverlayError::IORead: An IO error occurred when reading from ...
//!     overlaymanagerd::system_io::fs_read(path)
//! }
//! ```

use log::error;
use std::path::PathBuf;
use zbus::fdo;

/// Application-level errors for overlay management operations.
///
/// All errors implement `Display` and are formatted with the
/// `OverlayError::<variant>:` prefix, making them easily identifiable in logs
/// and in error messages sent over DBus.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// A caller-supplied argument was invalid: a negative user id, an empty
    /// overlay/target package name, or a mismatch between a prior record and
    /// freshly fetched package facts (see [`crate::rules::derive_state`]).
    #[error("OverlayError::BadArgument: {0}")]
    BadArgument(String),

    /// The caller lacks the capability required for the requested operation.
    #[error("OverlayError::PermissionDenied: {0}")]
    PermissionDenied(String),

    /// A [`crate::rules`] invariant was violated by data that should never
    /// reach it (e.g. a list mixing targets or users). This always indicates
    /// a bug in a caller, not bad external input.
    #[error("OverlayError::InvariantViolation: {0}")]
    InvariantViolation(String),

    /// A collaborator call (package database, user registry) failed or was
    /// unreachable. Callers degrade this to "not installed" / "no data".
    #[error("OverlayError::RemoteCallFailed: {0}")]
    RemoteCallFailed(String),

    /// The state codec's background worker failed to persist the registry.
    /// In-memory state remains authoritative; the next successful write
    /// catches up.
    #[error("OverlayError::PersistenceFailed: {0}")]
    PersistenceFailed(String),

    /// The persisted document could not be parsed on restore (unknown
    /// version, malformed structure, truncated write).
    #[error("OverlayError::ReadFailed: {0}")]
    ReadFailed(String),

    /// The external id-map tool exited non-zero or could not be spawned.
    #[error("OverlayError::IdmapFailed: {0}")]
    IdmapFailed(String),

    /// Failed to read from a file system path - wrapper around std::io::Error
    #[error("OverlayError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },

    /// Failed to write data to a file system path.
    #[error("OverlayError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },

    /// Failed to create a file or directory - wrapper around std::io::Error
    #[error("OverlayError::IOCreate: An IO error occurred when creating {file:?}: {e}")]
    IOCreate { file: PathBuf, e: std::io::Error },

    /// Failed to delete a file or directory - wrapper around std::io::Error
    #[error("OverlayError::IODelete: An IO error occurred when deleting {file:?}: {e}")]
    IODelete { file: PathBuf, e: std::io::Error },

    /// Failed to list directory contents.
    #[error("OverlayError::IOReadDir: An IO error occurred when reading directory {dir:?}: {e}")]
    IOReadDir { dir: PathBuf, e: std::io::Error },

    /// Any other unexpected internal error occurred.
    #[error("OverlayError::Internal: {0}")]
    Internal(String),
}

/// Convert OverlayError to DBus-compatible fdo::Error.
///
/// Maps application-level errors to appropriate DBus error types and logs
/// the error before conversion. The error message retains the
/// `OverlayError::<variant>:` prefix so a caller can tell application errors
/// apart from other DBus errors.
///
/// # Error Mapping
///
/// - `BadArgument` → `InvalidArgs`
/// - `PermissionDenied` → `AccessDenied`
/// - `IORead`, `IOWrite`, `IOCreate`, `IODelete`, `IOReadDir` → `IOError`
/// - All others → `Failed`
impl From<OverlayError> for fdo::Error {
    fn from(err: OverlayError) -> Self {
        error!("{err}");
        match err {
            OverlayError::BadArgument(..) => fdo::Error::InvalidArgs(err.to_string()),
            OverlayError::PermissionDenied(..) => fdo::Error::AccessDenied(err.to_string()),
            OverlayError::IORead { .. }
            | OverlayError::IOWrite { .. }
            | OverlayError::IOCreate { .. }
            | OverlayError::IODelete { .. }
            | OverlayError::IOReadDir { .. } => fdo::Error::IOError(err.to_string()),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}
