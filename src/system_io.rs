// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Error Wrapping File System I/O Helpers
//!
//! Thin wrappers around standard Rust file system operations, with automatic
//! conversion to [`OverlayError`] and trace logging. Used by [`crate::idmap`]
//! to probe/create id-map files and by [`crate::codec`] to persist the
//! registry document atomically.

use crate::error::OverlayError;
use log::trace;
use std::fs::{OpenOptions, create_dir_all, remove_file, rename};
use std::io::{Read, Write};
use std::path::Path;

/// Read the contents of a file to a String.
pub fn fs_read(file_path: &Path) -> Result<String, OverlayError> {
    trace!("Attempting to read from {file_path:?}");
    let mut buf = String::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_string(&mut buf));

    match result {
        Ok(_) => {
            trace!("Reading done");
            Ok(buf)
        }
        Err(e) => Err(OverlayError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Read the contents of a file to a byte vector.
pub fn fs_read_bytes(file_path: &Path) -> Result<Vec<u8>, OverlayError> {
    trace!("Attempting to read bytes from {file_path:?}");
    let mut buf = Vec::new();
    let result = OpenOptions::new()
        .read(true)
        .open(file_path)
        .and_then(|mut f| f.read_to_end(&mut buf));

    match result {
        Ok(_) => Ok(buf),
        Err(e) => Err(OverlayError::IORead {
            file: file_path.into(),
            e,
        }),
    }
}

/// Write a string value to a file, truncating any existing content.
///
/// * `create` - If `true`, create the file if it doesn't exist.
pub fn fs_write(file_path: &Path, create: bool, value: impl AsRef<str>) -> Result<(), OverlayError> {
    trace!(
        "Attempting to write {:?} to {:?}",
        value.as_ref(),
        file_path
    );
    let result = OpenOptions::new()
        .create(create)
        .write(true)
        .truncate(true)
        .open(file_path)
        .and_then(|mut f| write!(f, "{}", value.as_ref()));
    match result {
        Ok(_) => {
            trace!("Write done.");
            Ok(())
        }
        Err(e) => Err(OverlayError::IOWrite {
            file: file_path.into(),
            e,
        }),
    }
}

/// Recursively create directories up to the specified path.
pub fn fs_create_dir(path: &Path) -> Result<(), OverlayError> {
    trace!("Attempting to create '{path:?}'");
    create_dir_all(path).map_err(|e| OverlayError::IOCreate {
        file: path.into(),
        e,
    })
}

/// Remove a file, treating "already gone" as success (idempotent delete).
pub fn fs_remove_file_if_present(path: &Path) -> Result<(), OverlayError> {
    trace!("Attempting to delete '{path:?}'");
    match remove_file(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OverlayError::IODelete {
            file: path.into(),
            e,
        }),
    }
}

/// Atomically replace `dest` with the contents of `tmp` via rename. Both
/// paths must live on the same file system for the rename to be atomic.
pub fn fs_replace(tmp: &Path, dest: &Path) -> Result<(), OverlayError> {
    trace!("Renaming {tmp:?} onto {dest:?}");
    rename(tmp, dest).map_err(|e| OverlayError::IOWrite {
        file: dest.into(),
        e,
    })
}

/// Probe whether a path exists.
pub fn fs_exists(path: &Path) -> bool {
    path.exists()
}
