// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Id-map lifecycle: invoking the external id-map tool, probing for the
//! resulting file, and reading its "dangerous" header bit.
//!
//! An id-map file's mere presence signals that the overlay and its target
//! share at least one resource; the third 32-bit big-endian word of the
//! file signals whether the overlay reaches outside the target's
//! overlayable resource set ("dangerous").

use crate::config;
use crate::error::OverlayError;
use crate::system_io::{fs_exists, fs_read_bytes, fs_remove_file_if_present};
use log::{trace, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Byte offset of the "dangerous" flag: the third 32-bit word in the file.
const DANGEROUS_FLAG_OFFSET: usize = 2 * 4;

/// Compute the deterministic id-map file path for a given overlay
/// `base_code_path`: replace path separators with `@`, prefix with the
/// cache dir, append `@idmap`, dropping the leading separator first.
pub fn idmap_path(base_code_path: &str) -> PathBuf {
    let trimmed = base_code_path.trim_start_matches('/');
    let mangled = trimmed.replace('/', "@");
    PathBuf::from(config::IDMAP_CACHE_DIR).join(format!("{mangled}@idmap"))
}

/// Narrow interface over the external id-map tool binary, so
/// [`IdmapLifecycle`] can be unit tested against a fake.
pub trait IdmapTool {
    /// Run the tool to create an id-map at a path derived from `overlay_path`.
    /// Returns `true` iff the tool exited zero.
    fn idmap(&self, target_path: &str, overlay_path: &str) -> bool;
}

/// Subprocess-backed [`IdmapTool`] that shells out to the platform's
/// `idmap2` binary, the same way the daemon this is modeled on shells out to
/// its vendor helper binaries.
pub struct LiveIdmapTool;

impl IdmapTool for LiveIdmapTool {
    fn idmap(&self, target_path: &str, overlay_path: &str) -> bool {
        let output = Command::new("idmap2")
            .arg("create")
            .arg("--target-apk-path")
            .arg(target_path)
            .arg("--overlay-apk-path")
            .arg(overlay_path)
            .output();
        match output {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                warn!(
                    "idmap2 create exited non-zero: {}",
                    String::from_utf8_lossy(&out.stderr)
                );
                false
            }
            Err(e) => {
                warn!("failed to spawn idmap2: {e}");
                false
            }
        }
    }
}

/// Id-map file lifecycle: create/remove via the external tool, existence
/// and "dangerous" probes read directly off disk. All filesystem and
/// subprocess failures are non-fatal — the only observable
/// effect is the boolean return value, which [`crate::rules::derive_state`]
/// consumes.
pub struct IdmapLifecycle<T: IdmapTool = LiveIdmapTool> {
    tool: T,
}

impl IdmapLifecycle<LiveIdmapTool> {
    pub fn new() -> Self {
        IdmapLifecycle { tool: LiveIdmapTool }
    }
}

impl Default for IdmapLifecycle<LiveIdmapTool> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: IdmapTool> IdmapLifecycle<T> {
    pub fn with_tool(tool: T) -> Self {
        IdmapLifecycle { tool }
    }

    /// Invoke the external id-map tool. Returns `Err` only when the tool
    /// itself reports failure; the caller records this and Rules will
    /// subsequently observe `exists() == false` and derive
    /// `NotApprovedNoIdmap`.
    pub fn create(&self, target_path: &str, overlay_path: &str) -> Result<(), OverlayError> {
        trace!("creating idmap for target={target_path} overlay={overlay_path}");
        if self.tool.idmap(target_path, overlay_path) {
            Ok(())
        } else {
            Err(OverlayError::IdmapFailed(format!(
                "idmap2 create failed for overlay {overlay_path}"
            )))
        }
    }

    /// Idempotent best-effort removal; failure is logged only, never
    /// surfaced.
    pub fn remove(&self, base_code_path: &str) -> Result<(), OverlayError> {
        let path = idmap_path(base_code_path);
        if let Err(e) = fs_remove_file_if_present(&path) {
            warn!("failed to remove idmap at {path:?}: {e}");
        }
        Ok(())
    }

    /// Does an id-map file exist for this overlay?
    pub fn exists(&self, base_code_path: &str) -> bool {
        fs_exists(&idmap_path(base_code_path))
    }

    /// Read the dangerous flag from the id-map header. Defaults to `true`
    /// (fail safe) on any I/O error.
    pub fn is_dangerous(&self, base_code_path: &str) -> bool {
        is_dangerous_at(&idmap_path(base_code_path))
    }
}

/// Read the third 32-bit big-endian word of the file at `path`. Any read
/// failure, or a file shorter than 12 bytes, is treated as dangerous.
fn is_dangerous_at(path: &Path) -> bool {
    match fs_read_bytes(path) {
        Ok(bytes) if bytes.len() >= DANGEROUS_FLAG_OFFSET + 4 => {
            let word = u32::from_be_bytes([
                bytes[DANGEROUS_FLAG_OFFSET],
                bytes[DANGEROUS_FLAG_OFFSET + 1],
                bytes[DANGEROUS_FLAG_OFFSET + 2],
                bytes[DANGEROUS_FLAG_OFFSET + 3],
            ]);
            word != 0
        }
        Ok(_) => true,
        Err(e) => {
            warn!("failed to read idmap header at {path:?}: {e}");
            true
        }
    }
}
