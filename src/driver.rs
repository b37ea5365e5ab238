// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Package-event driver: keeps [`crate::registry::Registry`] consistent with
//! the host package database.
//!
//! The driver holds no persistent state of its own beyond the pending-upgrade
//! map used to carry an enabled/disabled bit across a replace (remove+add)
//! cycle — everything else is re-derived from fresh [`PackageFacts`] on every
//! call.

use crate::collaborators::PackageDatabase;
use crate::error::OverlayError;
use crate::idmap::IdmapLifecycle;
use crate::model::{OverlayRecord, UserId};
use crate::registry::Registry;
use crate::rules;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::Mutex;

/// Whether a package removal affects every user or only one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalScope {
    AllUsers,
    SingleUser(UserId),
}

pub struct PackageDriver<D: PackageDatabase> {
    registry: std::sync::Arc<Registry>,
    package_db: D,
    idmap: IdmapLifecycle,
    pending_upgrades: Mutex<HashMap<String, OverlayRecord>>,
}

impl<D: PackageDatabase> PackageDriver<D> {
    pub fn new(registry: std::sync::Arc<Registry>, package_db: D) -> Self {
        PackageDriver {
            registry,
            package_db,
            idmap: IdmapLifecycle::new(),
            pending_upgrades: Mutex::new(HashMap::new()),
        }
    }

    /// Handle `PACKAGE_ADDED`/`PACKAGE_CHANGED`/`PACKAGE_REPLACED` for
    /// package `name`, across every `known_users`.
    pub fn on_package_upserted(&self, name: &str, known_users: &[UserId]) {
        for &user_id in known_users {
            let Some(facts) = self.package_db.facts(name, user_id) else {
                continue;
            };
            if let Some(target_name) = &facts.overlay_target {
                if let Some(target_facts) = self.package_db.facts(target_name, user_id)
                    && let Err(e) = self
                        .idmap
                        .create(&target_facts.base_code_path, &facts.base_code_path)
                {
                    warn!("idmap create failed for {name}: {e}");
                }
                if let Err(e) = self.reconcile_overlay(&facts, user_id) {
                    warn!("reconcile failed for overlay {name} user {user_id}: {e}");
                }
            } else {
                self.reconcile_overlays_targeting(name, user_id);
            }
        }
    }

    /// Handle `PACKAGE_REMOVED` for package `name`. `scope` narrows which of
    /// `known_users` are affected; `known_users` is the full set the
    /// orchestrator tracks, since Registry itself exposes no cross-user
    /// index.
    pub fn on_package_removed(
        &self,
        name: &str,
        scope: RemovalScope,
        replacing: bool,
        known_users: &[UserId],
    ) {
        let affected_users: Vec<UserId> = match scope {
            RemovalScope::AllUsers => known_users.to_vec(),
            RemovalScope::SingleUser(u) => vec![u],
        };

        let mut any_existed = false;
        let mut last_base_path = None;
        for &user_id in &affected_users {
            let Some(prior) = self.find_record(user_id, name) else {
                continue;
            };
            any_existed = true;
            last_base_path = Some(prior.base_code_path.clone());
            let _ = self.registry.remove(user_id, &prior.target_package, name);
            if replacing {
                self.pending_upgrades.lock().unwrap().insert(name.to_string(), prior);
            } else {
                self.reconcile_overlays_targeting(name, user_id);
            }
        }

        let still_present = known_users
            .iter()
            .any(|&u| self.find_record(u, name).is_some());
        if !still_present
            && let Some(base_path) = last_base_path
            && let Err(e) = self.idmap.remove(&base_path)
        {
            warn!("idmap remove failed for {name}: {e}");
        }

        if !any_existed {
            debug!("package {name} removed with no prior overlay record; reconciling target");
            for &user_id in &affected_users {
                self.reconcile_overlays_targeting(name, user_id);
            }
        }
    }

    /// Find the overlay record for `overlay_name` under `user_id`, if any,
    /// searching across every target it could be registered under.
    fn find_record(&self, user_id: UserId, overlay_name: &str) -> Option<OverlayRecord> {
        self.registry.find_by_overlay(user_id, overlay_name)
    }

    /// Reconcile a single overlay `pkg` for `user_id`: derive its new state
    /// and write it back to the registry.
    pub fn reconcile_overlay(
        &self,
        pkg: &crate::model::PackageFacts,
        user_id: UserId,
    ) -> Result<(), OverlayError> {
        let prev = self
            .pending_upgrades
            .lock()
            .unwrap()
            .remove(&pkg.package_name)
            .or_else(|| {
                pkg.overlay_target
                    .as_ref()
                    .and_then(|t| self.registry.get(user_id, t, &pkg.package_name))
            });

        let target = pkg.overlay_target.as_deref().unwrap_or_default();
        let target_installed = self.package_db.is_installed(target, user_id);
        let idmap_exists = self.idmap.exists(&pkg.base_code_path);
        let idmap_dangerous = self.idmap.is_dangerous(&pkg.base_code_path);

        let state = rules::derive_state(
            prev.as_ref(),
            pkg,
            user_id,
            target_installed,
            idmap_exists,
            idmap_dangerous,
        )?;

        let record = OverlayRecord::new(
            pkg.package_name.clone(),
            target.to_string(),
            pkg.base_code_path.clone(),
            state,
            user_id,
            pkg.is_system,
            pkg.requested_overlay_priority,
        );
        trace!("reconciled {} for user {user_id}: {state}", pkg.package_name);
        self.registry.insert(record)?;
        Ok(())
    }

    /// Reconcile every overlay currently recorded against `target_name`,
    /// e.g. after that target's own facts changed.
    fn reconcile_overlays_targeting(&self, target_name: &str, user_id: UserId) {
        for record in self.registry.get_by_target(user_id, target_name) {
            if let Some(facts) = self.package_db.facts(&record.overlay_package, user_id)
                && let Err(e) = self.reconcile_overlay(&facts, user_id)
            {
                warn!(
                    "reconcile failed for overlay {} targeting {target_name}: {e}",
                    record.overlay_package
                );
            }
        }
    }

    /// Full reconciliation for `user_id`: walk every overlay package the
    /// package database reports installed, reconcile each, then drop any
    /// registry record whose overlay package is no longer installed.
    /// Run at boot and on user switch.
    pub fn reconcile_all(&self, user_id: UserId) {
        let installed = self.package_db.overlay_packages(user_id);
        for overlay_name in &installed {
            if let Some(facts) = self.package_db.facts(overlay_name, user_id)
                && let Err(e) = self.reconcile_overlay(&facts, user_id)
            {
                warn!("reconcile_all: failed on {overlay_name} for user {user_id}: {e}");
            }
        }

        let installed_set: std::collections::HashSet<&str> =
            installed.iter().map(String::as_str).collect();
        for record in self.registry.get_all(user_id) {
            if !installed_set.contains(record.overlay_package.as_str()) {
                let _ = self
                    .registry
                    .remove(user_id, &record.target_package, &record.overlay_package);
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakePackageDatabase;
    use crate::model::{ApprovalState, PackageFacts};
    use googletest::prelude::*;
    use std::sync::Arc;

    fn facts(name: &str, target: Option<&str>, enabled: bool, system: bool) -> PackageFacts {
        PackageFacts {
            package_name: name.to_string(),
            overlay_target: target.map(str::to_string),
            base_code_path: format!("/data/app/{name}/base.apk"),
            component_enabled: enabled,
            is_system: system,
            requested_overlay_priority: 0,
            signature_matches_target: true,
        }
    }

    #[gtest]
    fn reconcile_overlay_inserts_a_new_record() {
        let registry = Arc::new(Registry::new());
        let db = FakePackageDatabase::default();
        db.packages.lock().unwrap().insert(
            ("com.tgt".into(), 0),
            facts("com.tgt", None, true, false),
        );
        let driver = PackageDriver::new(registry.clone(), db);

        let overlay_facts = facts("com.ov", Some("com.tgt"), true, false);
        // No real idmap file exists on disk in this test, so the id-map
        // existence probe reports false and the derived state is
        // NotApprovedNoIdmap even though the target is installed.
        driver.reconcile_overlay(&overlay_facts, 0).unwrap();

        let record = registry.get(0, "com.tgt", "com.ov").unwrap();
        expect_eq!(record.state, ApprovalState::NotApprovedNoIdmap);
        expect_eq!(record.overlay_package, "com.ov");
    }

    #[gtest]
    fn reconcile_overlay_reports_component_disabled() {
        let registry = Arc::new(Registry::new());
        let db = FakePackageDatabase::default();
        let driver = PackageDriver::new(registry.clone(), db);
        let overlay_facts = facts("com.ov", Some("com.tgt"), false, false);
        driver.reconcile_overlay(&overlay_facts, 0).unwrap();
        let record = registry.get(0, "com.tgt", "com.ov").unwrap();
        expect_eq!(record.state, ApprovalState::NotApprovedComponentDisabled);
    }

    #[gtest]
    fn reconcile_all_drops_uninstalled_overlays() {
        let registry = Arc::new(Registry::new());
        let db = FakePackageDatabase::default();
        let driver = PackageDriver::new(registry.clone(), db);

        let stale = OverlayRecord::new(
            "com.stale",
            "com.tgt",
            "/data/app/com.stale/base.apk",
            ApprovalState::ApprovedDisabled,
            0,
            false,
            0,
        );
        registry.insert(stale).unwrap();

        driver.reconcile_all(0);

        expect_true!(registry.get(0, "com.tgt", "com.stale").is_none());
    }
}
