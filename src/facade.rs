// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! The `ServiceFacade` exposes the public operation surface over D-Bus,
//! authorizes callers, and translates requests into
//! [`crate::registry::Registry`] calls.
//!
//! All methods return `Result<_, fdo::Error>` via [`crate::error::OverlayError`]'s
//! conversion. Mutations never hold the registry lock across I/O: the facade
//! commits the in-memory change, queues a persistence flush, and returns —
//! the background [`crate::codec::StateCodec`] worker performs the actual
//! write.

use crate::collaborators::CapabilityChecker;
use crate::config;
use crate::error::OverlayError;
use crate::model::{OverlayRecord, UserId};
use crate::registry::Registry;
use log::{info, trace};
use std::collections::HashMap;
use std::sync::Arc;
use zbus::{fdo, interface};

/// Resolved identity of an incoming caller: the numeric uid D-Bus reports
/// for the sender, decoded into the user account it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub uid: u32,
    pub user_id: UserId,
}

impl CallerIdentity {
    pub fn from_uid(uid: u32) -> Self {
        CallerIdentity {
            uid,
            user_id: uid as UserId / config::PER_USER_RANGE,
        }
    }

    /// The trusted system identity bypasses every capability check.
    pub fn is_trusted_system(&self) -> bool {
        self.uid == 0
    }
}

/// Resolve the uid of the peer that sent the current D-Bus call, via the
/// bus daemon's `GetConnectionUnixUser`.
async fn caller_uid(
    connection: &zbus::Connection,
    header: &zbus::message::Header<'_>,
) -> Result<u32, OverlayError> {
    let Some(sender) = header.sender() else {
        return Err(OverlayError::PermissionDenied(
            "call carried no sender identity".into(),
        ));
    };
    let sender = sender.to_owned();
    let dbus_proxy = fdo::DBusProxy::new(connection)
        .await
        .map_err(|e| OverlayError::RemoteCallFailed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(sender.into())
        .await
        .map_err(|e| OverlayError::RemoteCallFailed(e.to_string()))
}

/// Instance of a [`zbus::object_server::Interface`] constructed using the
/// [`zbus::interface`] macro, served at [`config::SERVICE_PATH`].
pub struct ServiceFacade {
    registry: Arc<Registry>,
    capabilities: Arc<dyn CapabilityChecker>,
}

impl ServiceFacade {
    pub fn new(registry: Arc<Registry>, capabilities: Arc<dyn CapabilityChecker>) -> Self {
        ServiceFacade {
            registry,
            capabilities,
        }
    }

    fn require_non_negative_user(user_id: UserId) -> Result<(), OverlayError> {
        if user_id < 0 {
            return Err(OverlayError::BadArgument(format!(
                "userId must be non-negative, got {user_id}"
            )));
        }
        Ok(())
    }

    fn authorize_read(&self, caller: CallerIdentity, user_id: UserId) -> Result<(), OverlayError> {
        if caller.is_trusted_system() || caller.user_id == user_id {
            return Ok(());
        }
        if self
            .capabilities
            .has_capability(caller.uid, config::CAP_INTERACT_ACROSS_USERS_FULL)
        {
            return Ok(());
        }
        Err(OverlayError::PermissionDenied(format!(
            "uid {} may not read overlay state for user {user_id}",
            caller.uid
        )))
    }

    fn authorize_write(&self, caller: CallerIdentity) -> Result<(), OverlayError> {
        if caller.is_trusted_system() {
            return Ok(());
        }
        if self
            .capabilities
            .has_capability(caller.uid, config::CAP_CHANGE_CONFIGURATION)
        {
            return Ok(());
        }
        Err(OverlayError::PermissionDenied(format!(
            "uid {} lacks {}",
            caller.uid,
            config::CAP_CHANGE_CONFIGURATION
        )))
    }
}

#[interface(name = "com.example.overlaymanager")]
impl ServiceFacade {
    /// Every overlay known for `user_id`, grouped by target package.
    async fn get_all_overlays(
        &self,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<HashMap<String, Vec<WireRecord>>, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_read(caller, user_id)?;
        trace!("get_all_overlays user_id={user_id}");
        let mut grouped: HashMap<String, Vec<WireRecord>> = HashMap::new();
        for target in self.registry.targets_for_user(user_id) {
            let records = self
                .registry
                .get_by_target(user_id, &target)
                .into_iter()
                .map(WireRecord::from)
                .collect();
            grouped.insert(target, records);
        }
        Ok(grouped)
    }

    /// The ordered overlay list for one target.
    async fn get_overlays_for_target(
        &self,
        target: String,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<Vec<WireRecord>, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_read(caller, user_id)?;
        Ok(self
            .registry
            .get_by_target(user_id, &target)
            .into_iter()
            .map(WireRecord::from)
            .collect())
    }

    /// A single overlay's record, if known. The target is resolved by
    /// scanning the caller's records rather than taken as an argument —
    /// the only identifiers a caller is guaranteed to hold are the overlay
    /// package name and the user id.
    async fn get_overlay_info(
        &self,
        overlay_package: String,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<Option<WireRecord>, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_read(caller, user_id)?;
        Ok(self
            .registry
            .find_by_overlay(user_id, &overlay_package)
            .map(WireRecord::from))
    }

    /// Enable or disable `overlay_package`. Returns `true` iff the resulting
    /// enabled bit matches `enable`; a `NotApproved*` overlay is left
    /// unchanged and reports `true` only when `enable` already matched its
    /// (always-disabled) bit.
    async fn set_enabled(
        &self,
        overlay_package: String,
        enable: bool,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_write(caller)?;
        info!("set_enabled overlay={overlay_package} enable={enable} user={user_id}");

        let Some(record) = self.registry.find_by_overlay(user_id, &overlay_package) else {
            return Err(OverlayError::BadArgument(format!(
                "no overlay {overlay_package} for user {user_id}"
            ))
            .into());
        };
        let new_state = crate::rules::toggle(record.state, enable);
        let matches_request = new_state.is_enabled() == enable;
        let mut updated = record.clone();
        updated.state = new_state;
        self.registry.insert(updated)?;
        Ok(matches_request)
    }

    /// Reposition `overlay_package` immediately after `parent_package` (or
    /// at the front if empty). The target is resolved from the caller's
    /// existing record, the same as [`Self::get_overlay_info`].
    async fn set_priority(
        &self,
        overlay_package: String,
        parent_package: String,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_write(caller)?;
        let Some(record) = self.registry.find_by_overlay(user_id, &overlay_package) else {
            return Err(OverlayError::BadArgument(format!(
                "no overlay {overlay_package} for user {user_id}"
            ))
            .into());
        };
        let parent = if parent_package.is_empty() {
            None
        } else {
            Some(parent_package.as_str())
        };
        Ok(self
            .registry
            .change_priority(user_id, &record.target_package, &overlay_package, parent)?)
    }

    async fn set_highest_priority(
        &self,
        overlay_package: String,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_write(caller)?;
        let Some(record) = self.registry.find_by_overlay(user_id, &overlay_package) else {
            return Err(OverlayError::BadArgument(format!(
                "no overlay {overlay_package} for user {user_id}"
            ))
            .into());
        };
        Ok(self
            .registry
            .set_highest_priority(user_id, &record.target_package, &overlay_package)?)
    }

    async fn set_lowest_priority(
        &self,
        overlay_package: String,
        user_id: i64,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, fdo::Error> {
        Self::require_non_negative_user(user_id)?;
        let caller = CallerIdentity::from_uid(caller_uid(connection, &header).await?);
        self.authorize_write(caller)?;
        let Some(record) = self.registry.find_by_overlay(user_id, &overlay_package) else {
            return Err(OverlayError::BadArgument(format!(
                "no overlay {overlay_package} for user {user_id}"
            ))
            .into());
        };
        Ok(self
            .registry
            .set_lowest_priority(user_id, &record.target_package, &overlay_package)?)
    }
}

/// D-Bus wire representation of [`OverlayRecord`]; `zvariant` derives the
/// signature from field order, so this mirrors the struct it wraps rather
/// than reusing it directly (`OverlayRecord` intentionally has no
/// `zvariant::Type` derive — it is an internal value type).
#[derive(Debug, Clone, zbus::zvariant::Type, zbus::zvariant::SerializeDict, zbus::zvariant::DeserializeDict)]
#[zvariant(signature = "dict")]
pub struct WireRecord {
    pub overlay_package: String,
    pub target_package: String,
    pub base_code_path: String,
    pub state: u32,
    pub user_id: i64,
    pub is_system: bool,
    pub requested_priority: i32,
}

impl From<OverlayRecord> for WireRecord {
    fn from(record: OverlayRecord) -> Self {
        WireRecord {
            overlay_package: record.overlay_package,
            target_package: record.target_package,
            base_code_path: record.base_code_path,
            state: record.state.wire_value(),
            user_id: record.user_id,
            is_system: record.is_system,
            requested_priority: record.requested_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeCapabilityChecker;
    use crate::model::ApprovalState;
    use googletest::prelude::*;

    fn facade() -> ServiceFacade {
        ServiceFacade::new(
            Arc::new(Registry::new()),
            Arc::new(FakeCapabilityChecker { granted: Vec::new() }),
        )
    }

    #[gtest]
    fn require_non_negative_user_rejects_negative() {
        assert_that!(ServiceFacade::require_non_negative_user(-1), err(anything()));
    }

    #[gtest]
    fn require_non_negative_user_accepts_zero() {
        assert_that!(ServiceFacade::require_non_negative_user(0), ok(anything()));
    }

    #[gtest]
    fn authorize_read_allows_owning_user() {
        let facade = facade();
        let caller = CallerIdentity { uid: 100_007, user_id: 0 };
        assert_that!(facade.authorize_read(caller, 0), ok(anything()));
    }

    #[gtest]
    fn authorize_read_rejects_other_user_without_capability() {
        let facade = facade();
        let caller = CallerIdentity { uid: 100_007, user_id: 0 };
        assert_that!(facade.authorize_read(caller, 10), err(anything()));
    }

    #[gtest]
    fn authorize_read_allows_trusted_system() {
        let facade = facade();
        let caller = CallerIdentity { uid: 0, user_id: 0 };
        assert_that!(facade.authorize_read(caller, 10), ok(anything()));
    }

    #[gtest]
    fn authorize_write_rejects_non_root_without_capability() {
        let facade = facade();
        let caller = CallerIdentity { uid: 100_007, user_id: 0 };
        assert_that!(facade.authorize_write(caller), err(anything()));
    }

    #[gtest]
    fn wire_record_carries_the_numeric_state_tag() {
        let record = OverlayRecord::new(
            "com.ov",
            "com.tgt",
            "/x",
            ApprovalState::ApprovedEnabled,
            0,
            false,
            0,
        );
        let wire = WireRecord::from(record);
        expect_eq!(wire.state, ApprovalState::ApprovedEnabled.wire_value());
    }

    #[gtest]
    fn caller_identity_decodes_user_from_uid() {
        let caller = CallerIdentity::from_uid(10_000_007);
        expect_eq!(caller.user_id, 100);
    }
}
