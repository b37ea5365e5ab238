// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Pure functions that derive an overlay's approval state from package
//! facts, compute insertion order, and validate a proposed ordering.
//!
//! Nothing in this module performs I/O; [`crate::idmap`] and
//! [`crate::collaborators`] supply the facts these functions consume.

use crate::error::OverlayError;
use crate::model::{ApprovalState, OverlayRecord, PackageFacts, UserId};

/// Derive the approval state for `pkg` as observed for `user_id`, checking
/// preconditions in a fixed order (first match wins).
///
/// If `prev` is supplied and its `overlay_package`/`user_id` disagree with
/// `pkg`/`user_id`, this is a programmer error in the caller and is reported
/// as [`OverlayError::BadArgument`] rather than silently misapplied.
///
/// If `prev` is present and its state and the freshly derived state are
/// both in `{ApprovedEnabled, ApprovedDisabled}` and otherwise identical,
/// the current enabled/disabled state is preserved rather than reset to
/// `ApprovedDisabled` — this is what lets an already-enabled overlay stay
/// enabled across a routine reconciliation pass.
pub fn derive_state(
    prev: Option<&OverlayRecord>,
    pkg: &PackageFacts,
    user_id: UserId,
    target_installed: bool,
    idmap_exists: bool,
    idmap_dangerous: bool,
) -> Result<ApprovalState, OverlayError> {
    if let Some(prev) = prev
        && (prev.overlay_package != pkg.package_name || prev.user_id != user_id)
    {
        return Err(OverlayError::BadArgument(format!(
            "derive_state called with prev record for ({}, {}) but facts/user for ({}, {})",
            prev.overlay_package, prev.user_id, pkg.package_name, user_id
        )));
    }

    let derived = if !pkg.component_enabled {
        ApprovalState::NotApprovedComponentDisabled
    } else if !target_installed {
        ApprovalState::NotApprovedMissingTarget
    } else if !idmap_exists {
        ApprovalState::NotApprovedNoIdmap
    } else if pkg.is_system {
        ApprovalState::ApprovedAlwaysEnabled
    } else if pkg.signature_matches_target {
        ApprovalState::ApprovedDisabled
    } else if !idmap_dangerous {
        ApprovalState::ApprovedDisabled
    } else {
        ApprovalState::NotApprovedDangerousOverlay
    };

    if let Some(prev) = prev
        && matches!(
            derived,
            ApprovalState::ApprovedEnabled | ApprovalState::ApprovedDisabled
        )
        && matches!(
            prev.state,
            ApprovalState::ApprovedEnabled | ApprovalState::ApprovedDisabled
        )
    {
        return Ok(prev.state);
    }

    Ok(derived)
}

/// Apply an enable/disable request to `current`.
///
/// Returns the new state the record should transition to. Any state outside
/// `{ApprovedEnabled, ApprovedDisabled}` is returned unchanged — the request
/// is ignored and the caller observes "no change".
pub fn toggle(current: ApprovalState, enable: bool) -> ApprovalState {
    match current {
        ApprovalState::ApprovedEnabled | ApprovalState::ApprovedDisabled => {
            if enable {
                ApprovalState::ApprovedEnabled
            } else {
                ApprovalState::ApprovedDisabled
            }
        }
        other => other,
    }
}

/// Compute the index at which `record` should be inserted into `list` to
/// preserve the ordering invariant (system partition first, ascending
/// priority within it; non-system overlays always appended).
pub fn insert_index(record: &OverlayRecord, list: &[OverlayRecord]) -> usize {
    if !record.is_system {
        return list.len();
    }
    for (i, existing) in list.iter().enumerate() {
        if !(existing.is_system && existing.requested_priority <= record.requested_priority) {
            return i;
        }
    }
    list.len()
}

/// Validate that `list` satisfies the ordering invariant: system records
/// precede non-system records, and no two consecutive system records
/// decrease in `requested_priority`.
///
/// Lists of length 0 or 1 are always valid.
pub fn verify_order(list: &[OverlayRecord]) -> bool {
    if list.len() <= 1 {
        return true;
    }
    let mut seen_non_system = false;
    let mut last_system_priority: Option<i32> = None;
    for record in list {
        if record.is_system {
            if seen_non_system {
                return false;
            }
            if let Some(last) = last_system_priority
                && record.requested_priority < last
            {
                return false;
            }
            last_system_priority = Some(record.requested_priority);
        } else {
            seen_non_system = true;
        }
    }
    true
}

/// Assert that every record in `list` shares the same `target_package` and
/// `user_id`. This is a programmer-error check: a caller that builds a list
/// spanning multiple targets or users has already broken an invariant the
/// registry exists to maintain. Returns [`OverlayError::InvariantViolation`];
/// callers may `.expect()` this to turn it into a diagnosable abort.
pub fn assert_consistent(list: &[OverlayRecord]) -> Result<(), OverlayError> {
    let Some(first) = list.first() else {
        return Ok(());
    };
    for record in list.iter().skip(1) {
        if record.target_package != first.target_package || record.user_id != first.user_id {
            return Err(OverlayError::InvariantViolation(format!(
                "list mixes (target, user) pairs: ({}, {}) and ({}, {})",
                first.target_package, first.user_id, record.target_package, record.user_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod test_derive_state {
    use super::*;
    use googletest::prelude::*;
    use rstest::*;

    fn facts(
        is_system: bool,
        component_enabled: bool,
        signature_matches: bool,
    ) -> PackageFacts {
        PackageFacts {
            package_name: "com.ov".into(),
            overlay_target: Some("com.tgt".into()),
            base_code_path: "/data/app/com.ov/base.apk".into(),
            component_enabled,
            is_system,
            requested_overlay_priority: 0,
            signature_matches_target: signature_matches,
        }
    }

    #[gtest]
    fn component_disabled_wins_first() {
        let pkg = facts(false, false, true);
        let state = derive_state(None, &pkg, 0, true, true, false).unwrap();
        expect_eq!(state, ApprovalState::NotApprovedComponentDisabled);
    }

    #[gtest]
    fn missing_target_before_idmap_check() {
        let pkg = facts(false, true, true);
        let state = derive_state(None, &pkg, 0, false, false, false).unwrap();
        expect_eq!(state, ApprovalState::NotApprovedMissingTarget);
    }

    #[gtest]
    fn no_idmap_before_system_check() {
        let pkg = facts(true, true, true);
        let state = derive_state(None, &pkg, 0, true, false, false).unwrap();
        expect_eq!(state, ApprovalState::NotApprovedNoIdmap);
    }

    #[gtest]
    fn system_overlay_is_always_enabled() {
        let pkg = facts(true, true, false);
        let state = derive_state(None, &pkg, 0, true, true, true).unwrap();
        expect_eq!(state, ApprovalState::ApprovedAlwaysEnabled);
    }

    #[gtest]
    fn signature_match_is_approved_disabled_even_if_dangerous() {
        let pkg = facts(false, true, true);
        let state = derive_state(None, &pkg, 0, true, true, true).unwrap();
        expect_eq!(state, ApprovalState::ApprovedDisabled);
    }

    #[gtest]
    fn non_dangerous_mismatch_is_approved_disabled() {
        let pkg = facts(false, true, false);
        let state = derive_state(None, &pkg, 0, true, true, false).unwrap();
        expect_eq!(state, ApprovalState::ApprovedDisabled);
    }

    #[gtest]
    fn dangerous_mismatch_is_rejected() {
        let pkg = facts(false, true, false);
        let state = derive_state(None, &pkg, 0, true, true, true).unwrap();
        expect_eq!(state, ApprovalState::NotApprovedDangerousOverlay);
    }

    #[gtest]
    fn enabled_state_is_preserved_across_reconciliation() {
        let pkg = facts(false, true, true);
        let prev = OverlayRecord::new(
            "com.ov",
            "com.tgt",
            "/data/app/com.ov/base.apk",
            ApprovalState::ApprovedEnabled,
            0,
            false,
            0,
        );
        let state = derive_state(Some(&prev), &pkg, 0, true, true, false).unwrap();
        expect_eq!(state, ApprovalState::ApprovedEnabled);
    }

    #[gtest]
    fn prev_user_mismatch_is_bad_argument() {
        let pkg = facts(false, true, true);
        let prev = OverlayRecord::new(
            "com.ov",
            "com.tgt",
            "/data/app/com.ov/base.apk",
            ApprovalState::ApprovedEnabled,
            7,
            false,
            0,
        );
        let result = derive_state(Some(&prev), &pkg, 0, true, true, false);
        assert_that!(result, err(anything()));
    }

    #[gtest]
    #[rstest]
    #[case::enable_enabled(ApprovalState::ApprovedEnabled, true, ApprovalState::ApprovedEnabled)]
    #[case::disable_enabled(ApprovalState::ApprovedEnabled, false, ApprovalState::ApprovedDisabled)]
    #[case::enable_disabled(ApprovalState::ApprovedDisabled, true, ApprovalState::ApprovedEnabled)]
    #[case::enable_not_approved(
        ApprovalState::NotApprovedNoIdmap,
        true,
        ApprovalState::NotApprovedNoIdmap
    )]
    #[case::enable_always_enabled(
        ApprovalState::ApprovedAlwaysEnabled,
        false,
        ApprovalState::ApprovedAlwaysEnabled
    )]
    fn toggle_cases(
        #[case] current: ApprovalState,
        #[case] enable: bool,
        #[case] expected: ApprovalState,
    ) {
        expect_eq!(toggle(current, enable), expected);
    }
}

#[cfg(test)]
mod test_ordering {
    use super::*;
    use googletest::prelude::*;

    fn system(priority: i32) -> OverlayRecord {
        OverlayRecord::new(
            format!("com.sys{priority}"),
            "com.tgt",
            "/x",
            ApprovalState::ApprovedAlwaysEnabled,
            0,
            true,
            priority,
        )
    }

    fn non_system(name: &str) -> OverlayRecord {
        OverlayRecord::new(
            name,
            "com.tgt",
            "/x",
            ApprovalState::ApprovedDisabled,
            0,
            false,
            0,
        )
    }

    #[gtest]
    fn non_system_always_appends() {
        let list = vec![system(10), system(20)];
        expect_eq!(insert_index(&non_system("com.a"), &list), 2);
    }

    #[gtest]
    fn system_inserts_before_first_higher_priority() {
        let list = vec![system(10), system(30)];
        expect_eq!(insert_index(&system(20), &list), 1);
    }

    #[gtest]
    fn system_inserts_at_tail_when_highest() {
        let list = vec![system(10), system(20)];
        expect_eq!(insert_index(&system(30), &list), 2);
    }

    #[gtest]
    fn system_stops_at_first_non_system() {
        let list = vec![system(10), non_system("com.a")];
        expect_eq!(insert_index(&system(5), &list), 0);
        expect_eq!(insert_index(&system(50), &list), 1);
    }

    #[gtest]
    fn verify_order_rejects_non_system_before_system() {
        let list = vec![non_system("com.a"), system(10)];
        expect_false!(verify_order(&list));
    }

    #[gtest]
    fn verify_order_rejects_decreasing_system_priority() {
        let list = vec![system(20), system(10)];
        expect_false!(verify_order(&list));
    }

    #[gtest]
    fn verify_order_accepts_well_formed_list() {
        let list = vec![system(10), system(20), non_system("com.a")];
        expect_true!(verify_order(&list));
    }

    #[gtest]
    fn verify_order_accepts_short_lists() {
        expect_true!(verify_order(&[]));
        expect_true!(verify_order(&[non_system("com.a")]));
    }

    #[gtest]
    fn assert_consistent_rejects_mixed_targets() {
        let mut a = non_system("com.a");
        let mut b = non_system("com.b");
        a.target_package = "com.t1".into();
        b.target_package = "com.t2".into();
        assert_that!(assert_consistent(&[a, b]), err(anything()));
    }

    #[gtest]
    fn assert_consistent_accepts_uniform_list() {
        let list = vec![non_system("com.a"), non_system("com.b")];
        assert_that!(assert_consistent(&list), ok(anything()));
    }
}
