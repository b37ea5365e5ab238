// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Trait seams for every external system [`crate::driver::PackageDriver`]
//! depends on but does not own: the package database, the user registry,
//! the asset publisher, and the broadcast sink.
//!
//! Each trait has a `Live*` implementation that talks to the real platform,
//! and tests substitute simple in-memory fakes — the same seam the daemon
//! this is modeled on uses for its vendor tool collaborators.

use crate::error::OverlayError;
use crate::model::{PackageFacts, UserId};
use log::warn;
use std::process::Command;

/// Read-only access to installed package metadata.
pub trait PackageDatabase: Send + Sync {
    /// Fetch facts about `package_name` as installed for `user_id`, or
    /// `None` if it is not installed for that user.
    fn facts(&self, package_name: &str, user_id: UserId) -> Option<PackageFacts>;

    /// List every overlay package installed for `user_id`.
    fn overlay_packages(&self, user_id: UserId) -> Vec<String>;

    /// Is `package_name` installed for `user_id`?
    fn is_installed(&self, package_name: &str, user_id: UserId) -> bool {
        self.facts(package_name, user_id).is_some()
    }
}

/// Read-only access to which user accounts currently exist.
pub trait UserRegistry: Send + Sync {
    fn existing_users(&self) -> Vec<UserId>;
    fn user_exists(&self, user_id: UserId) -> bool {
        self.existing_users().contains(&user_id)
    }
}

/// Publishes the resolved overlay path set for a target package so the
/// resource loader can pick it up.
pub trait AssetPublisher: Send + Sync {
    fn publish(
        &self,
        user_id: UserId,
        target_package: &str,
        enabled_overlay_paths: &[String],
    ) -> Result<(), OverlayError>;
}

/// Emits a system broadcast announcing a target package's overlay paths
/// changed, so components that cache resources can reload.
pub trait BroadcastSink: Send + Sync {
    fn overlay_paths_changed(&self, user_id: UserId, target_package: &str);
}

/// Decides whether a calling uid holds a named capability
/// (`InteractAcrossUsersFull`, `ChangeConfiguration`). The capability
/// system itself stays external; this is the seam
/// [`crate::facade::ServiceFacade`] calls through.
pub trait CapabilityChecker: Send + Sync {
    fn has_capability(&self, uid: u32, capability: &str) -> bool;
}

/// Grants every capability to uid 0 (the trusted system identity) and
/// nothing else — the only bypass this daemon grants. A real
/// deployment would back this with the platform's permission service.
pub struct LiveCapabilityChecker;

impl CapabilityChecker for LiveCapabilityChecker {
    fn has_capability(&self, uid: u32, _capability: &str) -> bool {
        uid == 0
    }
}

/// [`PackageDatabase`] backed by the platform's package query tool.
pub struct LivePackageDatabase;

impl PackageDatabase for LivePackageDatabase {
    fn facts(&self, package_name: &str, user_id: UserId) -> Option<PackageFacts> {
        let output = Command::new("pm")
            .arg("dump")
            .arg(package_name)
            .arg("--user")
            .arg(user_id.to_string())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_pm_dump(&String::from_utf8_lossy(&output.stdout), package_name)
    }

    fn overlay_packages(&self, user_id: UserId) -> Vec<String> {
        let output = Command::new("pm")
            .arg("list")
            .arg("packages")
            .arg("--user")
            .arg(user_id.to_string())
            .arg("-f")
            .arg("--overlay-only")
            .output();
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|line| line.strip_prefix("package:"))
                .map(|s| s.trim().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The real `pm dump` output format is considerably richer than this;
/// extraction of the handful of fields [`PackageFacts`] needs is kept
/// deliberately narrow and forgiving of unrecognized lines.
fn parse_pm_dump(dump: &str, package_name: &str) -> Option<PackageFacts> {
    let mut base_code_path = None;
    let mut overlay_target = None;
    let mut component_enabled = true;
    let mut is_system = false;
    let mut requested_overlay_priority = 0;
    let mut signature_matches_target = false;

    for line in dump.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("codePath=") {
            base_code_path = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("overlayTarget=") {
            overlay_target = Some(v.to_string());
        } else if let Some(v) = line.strip_prefix("enabled=") {
            component_enabled = v.parse().unwrap_or(true);
        } else if let Some(v) = line.strip_prefix("isSystem=") {
            is_system = v.parse().unwrap_or(false);
        } else if let Some(v) = line.strip_prefix("overlayPriority=") {
            requested_overlay_priority = v.parse().unwrap_or(0);
        } else if let Some(v) = line.strip_prefix("signatureMatchesTarget=") {
            signature_matches_target = v.parse().unwrap_or(false);
        }
    }

    Some(PackageFacts {
        package_name: package_name.to_string(),
        overlay_target,
        base_code_path: base_code_path?,
        component_enabled,
        is_system,
        requested_overlay_priority,
        signature_matches_target,
    })
}

/// [`UserRegistry`] backed by the platform's user management tool.
pub struct LiveUserRegistry;

impl UserRegistry for LiveUserRegistry {
    fn existing_users(&self) -> Vec<UserId> {
        let output = Command::new("pm").arg("list").arg("users").output();
        match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|line| line.split("UserInfo{").nth(1))
                .filter_map(|rest| rest.split(':').next())
                .filter_map(|id| id.trim().parse::<UserId>().ok())
                .collect(),
            _ => vec![crate::config::BOOT_USER_ID],
        }
    }
}

/// [`AssetPublisher`] that writes the resolved path list through the same
/// `cmd overlay` platform tool the id-map lifecycle shells out to.
pub struct LiveAssetPublisher;

impl AssetPublisher for LiveAssetPublisher {
    fn publish(
        &self,
        user_id: UserId,
        target_package: &str,
        enabled_overlay_paths: &[String],
    ) -> Result<(), OverlayError> {
        let joined = enabled_overlay_paths.join(":");
        let output = Command::new("cmd")
            .arg("overlay")
            .arg("set-resolved-paths")
            .arg("--user")
            .arg(user_id.to_string())
            .arg(target_package)
            .arg(&joined)
            .output();
        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => {
                warn!(
                    "asset publish for {target_package} failed: {}",
                    String::from_utf8_lossy(&out.stderr)
                );
                Err(OverlayError::RemoteCallFailed(format!(
                    "set-resolved-paths failed for {target_package}"
                )))
            }
            Err(e) => Err(OverlayError::RemoteCallFailed(e.to_string())),
        }
    }
}

/// [`BroadcastSink`] that emits the change notice over the D-Bus connection
/// the daemon already maintains. Wired up in [`crate::main`] once the
/// connection is built.
pub struct DbusBroadcastSink {
    connection: zbus::Connection,
}

impl DbusBroadcastSink {
    pub fn new(connection: zbus::Connection) -> Self {
        DbusBroadcastSink { connection }
    }
}

impl BroadcastSink for DbusBroadcastSink {
    fn overlay_paths_changed(&self, user_id: UserId, target_package: &str) {
        let connection = self.connection.clone();
        let target_package = target_package.to_string();
        tokio::spawn(async move {
            let result = connection
                .emit_signal(
                    None::<&str>,
                    crate::config::SERVICE_PATH,
                    crate::config::SERVICE_NAME,
                    "OverlayPathsChanged",
                    &(user_id, target_package.as_str()),
                )
                .await;
            if let Err(e) = result {
                warn!("failed to emit OverlayPathsChanged signal: {e}");
            }
        });
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePackageDatabase {
        pub packages: Mutex<HashMap<(String, UserId), PackageFacts>>,
    }

    impl PackageDatabase for FakePackageDatabase {
        fn facts(&self, package_name: &str, user_id: UserId) -> Option<PackageFacts> {
            self.packages
                .lock()
                .unwrap()
                .get(&(package_name.to_string(), user_id))
                .cloned()
        }

        fn overlay_packages(&self, user_id: UserId) -> Vec<String> {
            self.packages
                .lock()
                .unwrap()
                .iter()
                .filter(|((_, u), facts)| *u == user_id && facts.overlay_target.is_some())
                .map(|((name, _), _)| name.clone())
                .collect()
        }
    }

    pub struct FakeUserRegistry {
        pub users: Vec<UserId>,
    }

    impl UserRegistry for FakeUserRegistry {
        fn existing_users(&self) -> Vec<UserId> {
            self.users.clone()
        }
    }

    #[derive(Default)]
    pub struct FakeAssetPublisher {
        pub published: Mutex<Vec<(UserId, String, Vec<String>)>>,
    }

    impl AssetPublisher for FakeAssetPublisher {
        fn publish(
            &self,
            user_id: UserId,
            target_package: &str,
            enabled_overlay_paths: &[String],
        ) -> Result<(), OverlayError> {
            self.published.lock().unwrap().push((
                user_id,
                target_package.to_string(),
                enabled_overlay_paths.to_vec(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeBroadcastSink {
        pub notified: Mutex<Vec<(UserId, String)>>,
    }

    impl BroadcastSink for FakeBroadcastSink {
        fn overlay_paths_changed(&self, user_id: UserId, target_package: &str) {
            self.notified
                .lock()
                .unwrap()
                .push((user_id, target_package.to_string()));
        }
    }

    pub struct FakeCapabilityChecker {
        pub granted: Vec<(u32, &'static str)>,
    }

    impl CapabilityChecker for FakeCapabilityChecker {
        fn has_capability(&self, uid: u32, capability: &str) -> bool {
            uid == 0 || self.granted.iter().any(|(u, c)| *u == uid && *c == capability)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use googletest::prelude::*;

    #[gtest]
    fn fake_package_database_round_trips_facts() {
        let db = FakePackageDatabase::default();
        let facts = PackageFacts {
            package_name: "com.ov".into(),
            overlay_target: Some("com.tgt".into()),
            base_code_path: "/x".into(),
            component_enabled: true,
            is_system: false,
            requested_overlay_priority: 0,
            signature_matches_target: true,
        };
        db.packages.lock().unwrap().insert(("com.ov".into(), 0), facts.clone());
        expect_eq!(db.facts("com.ov", 0), Some(facts));
        expect_true!(db.is_installed("com.ov", 0));
        expect_false!(db.is_installed("com.ov", 1));
    }

    #[gtest]
    fn fake_user_registry_reports_membership() {
        let registry = FakeUserRegistry { users: vec![0, 10] };
        expect_true!(registry.user_exists(10));
        expect_false!(registry.user_exists(99));
    }

    #[gtest]
    fn parse_pm_dump_extracts_known_fields() {
        let dump = "codePath=/data/app/com.ov/base.apk\noverlayTarget=com.tgt\nenabled=false\nisSystem=true\noverlayPriority=5\nsignatureMatchesTarget=true\n";
        let facts = parse_pm_dump(dump, "com.ov").unwrap();
        expect_eq!(facts.base_code_path, "/data/app/com.ov/base.apk");
        expect_eq!(facts.overlay_target, Some("com.tgt".to_string()));
        expect_false!(facts.component_enabled);
        expect_true!(facts.is_system);
        expect_eq!(facts.requested_overlay_priority, 5);
    }

    #[gtest]
    fn parse_pm_dump_requires_code_path() {
        expect_true!(parse_pm_dump("overlayTarget=com.tgt\n", "com.ov").is_none());
    }
}
