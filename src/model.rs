// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Core data model: [`OverlayRecord`], [`ApprovalState`] and [`PackageFacts`].
//!
//! These are plain value types with no I/O of their own; [`crate::rules`]
//! derives [`ApprovalState`] values, [`crate::registry`] stores
//! [`OverlayRecord`]s, and [`crate::codec`] serializes them.

use std::fmt;

/// End-user account identifier. Never negative; validated at the
/// [`crate::facade`] boundary.
pub type UserId = i64;

/// One of the seven mutually exclusive approval states an overlay can be in.
/// See spec §3 for the full decision table that produces these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalState {
    /// System-supplied overlay; always active; cannot be disabled.
    ApprovedAlwaysEnabled,
    /// User-controlled overlay, currently active.
    ApprovedEnabled,
    /// User-controlled overlay, currently inactive.
    ApprovedDisabled,
    /// Overlay package is disabled at the package level.
    NotApprovedComponentDisabled,
    /// Target package is not installed for this user.
    NotApprovedMissingTarget,
    /// Id-map file does not exist (no overlapping resources).
    NotApprovedNoIdmap,
    /// Id-map exists but the overlay touches resources the target did not
    /// mark overlayable, and signatures do not match.
    NotApprovedDangerousOverlay,
}

impl ApprovalState {
    /// An overlay is "enabled" iff its state is one that participates in
    /// resource lookup.
    pub fn is_enabled(self) -> bool {
        matches!(
            self,
            ApprovalState::ApprovedAlwaysEnabled | ApprovalState::ApprovedEnabled
        )
    }

    /// An overlay is "approved" iff it has passed all preconditions to be
    /// usable, whether or not it is currently enabled.
    pub fn is_approved(self) -> bool {
        matches!(
            self,
            ApprovalState::ApprovedAlwaysEnabled
                | ApprovalState::ApprovedEnabled
                | ApprovalState::ApprovedDisabled
        )
    }

    /// Stable wire value for [`crate::codec`], frozen on first release.
    /// Never renumber existing variants; append new ones at the end.
    pub fn wire_value(self) -> u32 {
        match self {
            ApprovalState::ApprovedAlwaysEnabled => 0,
            ApprovalState::ApprovedEnabled => 1,
            ApprovalState::ApprovedDisabled => 2,
            ApprovalState::NotApprovedComponentDisabled => 3,
            ApprovalState::NotApprovedMissingTarget => 4,
            ApprovalState::NotApprovedNoIdmap => 5,
            ApprovalState::NotApprovedDangerousOverlay => 6,
        }
    }

    /// Inverse of [`ApprovalState::wire_value`]. Returns `None` for unknown
    /// wire values so callers can surface `ReadFailed`.
    pub fn from_wire_value(value: u32) -> Option<Self> {
        Some(match value {
            0 => ApprovalState::ApprovedAlwaysEnabled,
            1 => ApprovalState::ApprovedEnabled,
            2 => ApprovalState::ApprovedDisabled,
            3 => ApprovalState::NotApprovedComponentDisabled,
            4 => ApprovalState::NotApprovedMissingTarget,
            5 => ApprovalState::NotApprovedNoIdmap,
            6 => ApprovalState::NotApprovedDangerousOverlay,
            _ => return None,
        })
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApprovalState::ApprovedAlwaysEnabled => "ApprovedAlwaysEnabled",
            ApprovalState::ApprovedEnabled => "ApprovedEnabled",
            ApprovalState::ApprovedDisabled => "ApprovedDisabled",
            ApprovalState::NotApprovedComponentDisabled => "NotApprovedComponentDisabled",
            ApprovalState::NotApprovedMissingTarget => "NotApprovedMissingTarget",
            ApprovalState::NotApprovedNoIdmap => "NotApprovedNoIdmap",
            ApprovalState::NotApprovedDangerousOverlay => "NotApprovedDangerousOverlay",
        };
        f.write_str(name)
    }
}

/// An immutable value describing one overlay package's relationship to one
/// target package for one user. Replaced wholesale on any state transition;
/// never mutated in place (see [`crate::registry::Registry::insert`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRecord {
    /// Unique identifier of the overlay package.
    pub overlay_package: String,
    /// Identifier of the target package it overlays.
    pub target_package: String,
    /// Absolute path to the overlay's code artifact.
    pub base_code_path: String,
    /// Current approval/enabled state.
    pub state: ApprovalState,
    /// End-user account this record belongs to.
    pub user_id: UserId,
    /// Whether the overlay package is part of the base system image.
    /// Carried alongside the record (rather than re-fetched from
    /// [`PackageFacts`] on every ordering decision) because §3's ordering
    /// invariants are defined purely in terms of the list's own records.
    pub is_system: bool,
    /// Declared priority among system overlays of the same target; ignored
    /// for non-system overlays.
    pub requested_priority: i32,
}

impl OverlayRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        overlay_package: impl Into<String>,
        target_package: impl Into<String>,
        base_code_path: impl Into<String>,
        state: ApprovalState,
        user_id: UserId,
        is_system: bool,
        requested_priority: i32,
    ) -> Self {
        OverlayRecord {
            overlay_package: overlay_package.into(),
            target_package: target_package.into(),
            base_code_path: base_code_path.into(),
            state,
            user_id,
            is_system,
            requested_priority,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }
}

/// Read-only view of a package fetched from the external package database
/// (spec §6.5). This is never stored; a fresh copy is fetched on every
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFacts {
    /// Name of the package these facts describe.
    pub package_name: String,
    /// If this package is an overlay, the target package it overlays.
    pub overlay_target: Option<String>,
    /// Absolute path to the package's code artifact.
    pub base_code_path: String,
    /// Whether the package's main component is enabled.
    pub component_enabled: bool,
    /// Whether this package was installed as part of the base system image.
    pub is_system: bool,
    /// Declared priority among system overlays of the same target.
    pub requested_overlay_priority: i32,
    /// Whether this overlay's signing certificate matches its target's.
    pub signature_matches_target: bool,
}
