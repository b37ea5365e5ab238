// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! In-memory overlay registry: the single source of truth for every
//! [`OverlayRecord`] the daemon knows about, keyed by user and target
//! package.
//!
//! Mutations take an exclusive lock, compute the new state, and release the
//! lock before notifying listeners — a listener that calls back into the
//! registry must never deadlock against the mutation that triggered it.

use crate::error::OverlayError;
use crate::model::{OverlayRecord, UserId};
use crate::rules;
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Invoked after a successful mutation, outside the registry's lock.
pub trait RegistryListener: Send + Sync {
    fn on_changed(&self, user_id: UserId, target_package: &str, records: &[OverlayRecord]);
}

type TargetMap = HashMap<String, Vec<OverlayRecord>>;
type UserMap = HashMap<UserId, TargetMap>;

/// Thread-safe store of [`OverlayRecord`]s, one priority-ordered list per
/// `(user_id, target_package)` pair.
pub struct Registry {
    inner: Mutex<UserMap>,
    listeners: Mutex<Vec<Arc<dyn RegistryListener>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Insert `record` at its rule-ordered position, replacing any existing
    /// record for the same overlay package. Returns the new ordered list for
    /// the affected target.
    pub fn insert(&self, record: OverlayRecord) -> Result<Vec<OverlayRecord>, OverlayError> {
        let user_id = record.user_id;
        let target = record.target_package.clone();
        let snapshot = {
            let mut guard = self.inner.lock().unwrap();
            let list = guard
                .entry(user_id)
                .or_default()
                .entry(target.clone())
                .or_default();
            list.retain(|r| r.overlay_package != record.overlay_package);
            let index = rules::insert_index(&record, list);
            list.insert(index, record);
            rules::assert_consistent(list)?;
            list.clone()
        };
        self.notify(user_id, &target, &snapshot);
        Ok(snapshot)
    }

    /// Remove the overlay with `overlay_package` from `target` for `user_id`.
    /// Returns `false` iff no such overlay was present (no-op). An emptied
    /// target or user sub-mapping is pruned rather than left behind.
    pub fn remove(
        &self,
        user_id: UserId,
        target: &str,
        overlay_package: &str,
    ) -> Result<bool, OverlayError> {
        let (found, snapshot) = {
            let mut guard = self.inner.lock().unwrap();
            let Some(targets) = guard.get_mut(&user_id) else {
                return Ok(false);
            };
            let Some(list) = targets.get_mut(target) else {
                return Ok(false);
            };
            let before = list.len();
            list.retain(|r| r.overlay_package != overlay_package);
            let found = list.len() != before;
            let snapshot = list.clone();
            if list.is_empty() {
                targets.remove(target);
            }
            let user_now_empty = targets.is_empty();
            if user_now_empty {
                guard.remove(&user_id);
            }
            (found, snapshot)
        };
        if found {
            self.notify(user_id, target, &snapshot);
        }
        Ok(found)
    }

    /// Find the record for `overlay_package` under `user_id`, regardless of
    /// which target it is registered against. Used by RPCs whose contract
    /// only guarantees an overlay package name and a user id, not the target.
    pub fn find_by_overlay(&self, user_id: UserId, overlay_package: &str) -> Option<OverlayRecord> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(&user_id)?
            .values()
            .flatten()
            .find(|r| r.overlay_package == overlay_package)
            .cloned()
    }

    /// Drop every record belonging to `user_id`, e.g. on account removal.
    /// Returns the list of targets that had records removed.
    pub fn remove_all_for_user(&self, user_id: UserId) -> Vec<String> {
        let removed_targets = {
            let mut guard = self.inner.lock().unwrap();
            match guard.remove(&user_id) {
                Some(targets) => targets.into_keys().collect::<Vec<_>>(),
                None => Vec::new(),
            }
        };
        for target in &removed_targets {
            self.notify(user_id, target, &[]);
        }
        removed_targets
    }

    /// Reposition `overlay_package` to sit immediately after `parent_package`
    /// (or at the front if `parent_package` is `None`). Builds a candidate
    /// ordering and commits it only if [`rules::verify_order`] accepts it;
    /// a `parent_package` absent from the list, or a candidate that would
    /// violate ordering, leaves the list untouched and returns `Ok(false)`.
    pub fn change_priority(
        &self,
        user_id: UserId,
        target: &str,
        overlay_package: &str,
        parent_package: Option<&str>,
    ) -> Result<bool, OverlayError> {
        let (committed, snapshot) = {
            let mut guard = self.inner.lock().unwrap();
            let list = guard
                .get_mut(&user_id)
                .and_then(|targets| targets.get_mut(target))
                .ok_or_else(|| {
                    OverlayError::BadArgument(format!("unknown target {target} for user {user_id}"))
                })?;
            let current = list
                .iter()
                .position(|r| r.overlay_package == overlay_package)
                .ok_or_else(|| {
                    OverlayError::BadArgument(format!("unknown overlay {overlay_package}"))
                })?;

            let mut candidate = list.clone();
            let record = candidate.remove(current);
            let target_index = match parent_package {
                None => 0,
                Some(parent) => match candidate.iter().position(|r| r.overlay_package == parent) {
                    Some(i) => i + 1,
                    None => return Ok(false),
                },
            };
            candidate.insert(target_index, record);

            if candidate == *list {
                (true, None)
            } else if rules::verify_order(&candidate) {
                *list = candidate.clone();
                (true, Some(candidate))
            } else {
                (false, None)
            }
        };
        if let Some(snapshot) = snapshot {
            self.notify(user_id, target, &snapshot);
        }
        Ok(committed)
    }

    /// Move `overlay_package` to the tail of `target`'s list. A no-op
    /// (returns `true`, no event fired) if it is already the tail.
    pub fn set_highest_priority(
        &self,
        user_id: UserId,
        target: &str,
        overlay_package: &str,
    ) -> Result<bool, OverlayError> {
        let list = self.get_by_target(user_id, target);
        match list.last() {
            Some(tail) if tail.overlay_package == overlay_package => Ok(true),
            Some(tail) => {
                self.change_priority(user_id, target, overlay_package, Some(tail.overlay_package.as_str()))
            }
            None => self.change_priority(user_id, target, overlay_package, None),
        }
    }

    pub fn set_lowest_priority(
        &self,
        user_id: UserId,
        target: &str,
        overlay_package: &str,
    ) -> Result<bool, OverlayError> {
        self.change_priority(user_id, target, overlay_package, None)
    }

    /// Fetch a single record by overlay package name. Defensive copy.
    pub fn get(
        &self,
        user_id: UserId,
        target: &str,
        overlay_package: &str,
    ) -> Option<OverlayRecord> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(&user_id)
            .and_then(|targets| targets.get(target))
            .and_then(|list| list.iter().find(|r| r.overlay_package == overlay_package))
            .cloned()
    }

    /// Fetch the full ordered list of overlays for one target. Defensive copy.
    pub fn get_by_target(&self, user_id: UserId, target: &str) -> Vec<OverlayRecord> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(&user_id)
            .and_then(|targets| targets.get(target))
            .cloned()
            .unwrap_or_default()
    }

    /// Fetch every record known for `user_id`, across all targets.
    pub fn get_all(&self, user_id: UserId) -> Vec<OverlayRecord> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(&user_id)
            .map(|targets| targets.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Every user id that currently has at least one record, across all
    /// targets. Used by persistence and the change listener to snapshot the
    /// whole registry without the caller having to track live users itself.
    pub fn known_users(&self) -> Vec<UserId> {
        let guard = self.inner.lock().unwrap();
        guard
            .iter()
            .filter(|(_, targets)| targets.values().any(|list| !list.is_empty()))
            .map(|(&u, _)| u)
            .collect()
    }

    /// Every distinct target package with at least one overlay for
    /// `user_id`.
    pub fn targets_for_user(&self, user_id: UserId) -> Vec<String> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(&user_id)
            .map(|targets| targets.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn notify(&self, user_id: UserId, target: &str, records: &[OverlayRecord]) {
        trace!("notifying listeners: user={user_id} target={target} count={}", records.len());
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener.on_changed(user_id, target, records);
        }
        debug!("registry updated: user={user_id} target={target}");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
