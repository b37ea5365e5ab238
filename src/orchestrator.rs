// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Boot sequence and user-switch reconciliation.
//!
//! Wires together [`crate::registry::Registry`], [`crate::codec::StateCodec`],
//! [`crate::driver::PackageDriver`] and the asset/broadcast collaborators
//! into the seven ordered steps the daemon performs before it becomes ready
//! to serve requests.

use crate::collaborators::{AssetPublisher, BroadcastSink, PackageDatabase, UserRegistry};
use crate::driver::PackageDriver;
use crate::model::UserId;
use crate::registry::{Registry, RegistryListener};
use log::{info, warn};
use std::sync::Arc;

/// Registered with [`Registry`] at boot; on every change it persists state,
/// republishes asset paths for the affected target, and emits a broadcast.
/// Runs after every registry mutation.
pub struct ChangeListener<A: AssetPublisher, B: BroadcastSink> {
    codec: Arc<crate::codec::StateCodec>,
    registry: Arc<Registry>,
    asset_publisher: A,
    broadcast: B,
}

impl<A: AssetPublisher, B: BroadcastSink> ChangeListener<A, B> {
    pub fn new(
        codec: Arc<crate::codec::StateCodec>,
        registry: Arc<Registry>,
        asset_publisher: A,
        broadcast: B,
    ) -> Self {
        ChangeListener {
            codec,
            registry,
            asset_publisher,
            broadcast,
        }
    }

    fn snapshot_all(&self) -> Vec<(UserId, Vec<crate::model::OverlayRecord>)> {
        self.registry
            .known_users()
            .into_iter()
            .map(|u| (u, self.registry.get_all(u)))
            .collect()
    }
}

impl<A: AssetPublisher, B: BroadcastSink> RegistryListener for ChangeListener<A, B> {
    fn on_changed(&self, user_id: UserId, target_package: &str, records: &[crate::model::OverlayRecord]) {
        self.codec.request_flush(self.snapshot_all());

        let enabled_paths: Vec<String> = records
            .iter()
            .filter(|r| r.is_enabled())
            .map(|r| r.base_code_path.clone())
            .collect();
        if let Err(e) = self
            .asset_publisher
            .publish(user_id, target_package, &enabled_paths)
        {
            warn!("asset publish failed for {target_package} user {user_id}: {e}");
        }
        self.broadcast.overlay_paths_changed(user_id, target_package);
    }
}

/// Drives the seven-step boot sequence and user-switch re-reconciliation.
pub struct Orchestrator<D: PackageDatabase, U: UserRegistry> {
    registry: Arc<Registry>,
    codec: Arc<crate::codec::StateCodec>,
    driver: Arc<PackageDriver<D>>,
    users: U,
}

impl<D: PackageDatabase, U: UserRegistry> Orchestrator<D, U> {
    pub fn new(
        registry: Arc<Registry>,
        codec: Arc<crate::codec::StateCodec>,
        driver: Arc<PackageDriver<D>>,
        users: U,
    ) -> Self {
        Orchestrator {
            registry,
            codec,
            driver,
            users,
        }
    }

    /// Restores persisted state, reconciles the boot user, then flushes.
    /// Step 1 (subscribing the driver to package events) and step 7
    /// (publishing the facade) are the caller's responsibility since they
    /// depend on the host event bus / D-Bus connection respectively.
    pub fn boot(&self) {
        self.restore();
        self.reconcile_user(crate::config::BOOT_USER_ID);
        let snapshot = self
            .registry
            .known_users()
            .into_iter()
            .map(|u| (u, self.registry.get_all(u)))
            .collect();
        self.codec.request_flush(snapshot);
        info!("overlay manager boot sequence complete");
    }

    /// Reconcile a newly switched-to user against the package database.
    pub fn on_user_switch(&self, user_id: UserId) {
        self.reconcile_user(user_id);
    }

    fn restore(&self) {
        let live_users: std::collections::HashSet<UserId> =
            self.users.existing_users().into_iter().collect();
        match self.codec.restore() {
            Ok(restored) => {
                for (user_id, records) in restored {
                    if !live_users.contains(&user_id) {
                        warn!("dropping persisted records for non-live user {user_id}");
                        continue;
                    }
                    for record in records {
                        if let Err(e) = self.registry.insert(record) {
                            warn!("failed to restore a record for user {user_id}: {e}");
                        }
                    }
                }
            }
            Err(e) => warn!("state restore failed, starting with an empty registry: {e}"),
        }
    }

    fn reconcile_user(&self, user_id: UserId) {
        self.driver.reconcile_all(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{
        FakeAssetPublisher, FakeBroadcastSink, FakePackageDatabase, FakeUserRegistry,
    };

    #[tokio::test]
    async fn boot_restores_and_reconciles_without_panicking() {
        let registry = Arc::new(Registry::new());
        let codec = Arc::new(crate::codec::StateCodec::spawn_at(
            std::path::PathBuf::from("/nonexistent/overlay/boot-test.xml"),
        ));
        let db = FakePackageDatabase::default();
        let driver = Arc::new(PackageDriver::new(registry.clone(), db));
        let users = FakeUserRegistry { users: vec![0] };
        let orchestrator = Orchestrator::new(registry, codec, driver, users);
        orchestrator.boot();
    }

    #[tokio::test]
    async fn change_listener_publishes_and_broadcasts() {
        let registry = Arc::new(Registry::new());
        let codec = Arc::new(crate::codec::StateCodec::spawn_at(
            std::path::PathBuf::from("/nonexistent/overlay/listener-test.xml"),
        ));
        let asset_publisher = FakeAssetPublisher::default();
        let broadcast = FakeBroadcastSink::default();
        let listener = ChangeListener::new(codec, registry.clone(), asset_publisher, broadcast);

        let record = crate::model::OverlayRecord::new(
            "com.ov",
            "com.tgt",
            "/x",
            crate::model::ApprovalState::ApprovedEnabled,
            0,
            false,
            0,
        );
        listener.on_changed(0, "com.tgt", std::slice::from_ref(&record));

        assert_eq!(listener.asset_publisher.published.lock().unwrap().len(), 1);
        assert_eq!(listener.broadcast.notified.lock().unwrap().len(), 1);
    }
}
