// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Overlay manager daemon (overlaymanagerd) - tracks which resource overlay
//! packages exist, decides which are admissible, and exposes an RPC surface
//! to enable, disable and reorder them per target package per user.
//!
//! # DBus Service
//!
//! - **Service name**: `com.example.overlaymanager`
//! - **Object path**: `/com/example/overlaymanager`
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`.
//!
//! # Boot sequence
//!
//! See [`overlaymanagerd::orchestrator`] for the seven ordered steps this
//! binary performs before serving requests: restoring persisted state,
//! reconciling the boot user against the host package database, publishing
//! asset paths, registering the change listener, and finally serving the
//! [`overlaymanagerd::facade::ServiceFacade`] on the bus.

use log::info;
use overlaymanagerd::codec::StateCodec;
use overlaymanagerd::collaborators::{
    DbusBroadcastSink, LiveAssetPublisher, LiveCapabilityChecker, LivePackageDatabase,
    LiveUserRegistry,
};
use overlaymanagerd::config;
use overlaymanagerd::driver::PackageDriver;
use overlaymanagerd::facade::ServiceFacade;
use overlaymanagerd::orchestrator::{ChangeListener, Orchestrator};
use overlaymanagerd::registry::Registry;
use std::error::Error;
use std::sync::Arc;
use zbus::connection;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let registry = Arc::new(Registry::new());
    let codec = Arc::new(StateCodec::spawn());
    let driver = Arc::new(PackageDriver::new(registry.clone(), LivePackageDatabase));
    let users = LiveUserRegistry;

    // Step 1: the host event bus connection that would deliver
    // PACKAGE_ADDED/CHANGED/REPLACED/REMOVED is platform glue outside this
    // core's scope; the driver above is ready to receive them via
    // `on_package_upserted`/`on_package_removed` once wired to that source.

    let connection = connection::Builder::system()?
        .name(config::SERVICE_NAME)?
        .build()
        .await?;

    let asset_publisher = LiveAssetPublisher;
    let broadcast = DbusBroadcastSink::new(connection.clone());
    let listener = Arc::new(ChangeListener::new(
        codec.clone(),
        registry.clone(),
        asset_publisher,
        broadcast,
    ));
    registry.add_listener(listener);

    // Steps 2-5: restore persisted state, reconcile the boot user, persist.
    let orchestrator = Orchestrator::new(registry.clone(), codec.clone(), driver, users);
    orchestrator.boot();

    // Step 7: publish the facade.
    let facade = ServiceFacade::new(registry, Arc::new(LiveCapabilityChecker));
    connection
        .object_server()
        .at(config::SERVICE_PATH, facade)
        .await?;

    info!("started {} dbus service", config::SERVICE_NAME);

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, flushing persisted state");
    codec.wait_idle().await;

    Ok(())
}
