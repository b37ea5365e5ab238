// This file is part of overlaymanagerd, a daemon that manages resource
// overlay packages for a packaged-application platform.
//
// SPDX-License-Identifier: GPL-3.0-only

//! Persistence of the registry to stable storage.
//!
//! The document format is a small XML-like tree:
//!
//! ```xml
//! <overlays version="1">
//!   <user id="0">
//!     <target name="com.example.target">
//!       <overlay package="com.example.overlay" path="/data/app/.../base.apk"
//!                 state="1" system="false" priority="0"/>
//!     </target>
//!   </user>
//! </overlays>
//! ```
//!
//! Writes go to a temp file beside the destination, then [`fs_replace`]
//! renames it into place — a reader never observes a partially written
//! document. A single background task owns the writer side so concurrent
//! registry mutations coalesce into one flush rather than racing each other.

use crate::config;
use crate::error::OverlayError;
use crate::model::{ApprovalState, OverlayRecord, UserId};
use crate::system_io::{fs_create_dir, fs_read, fs_replace, fs_write};
use log::{debug, warn};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};

const DOCUMENT_VERSION: &str = "1";

/// Encode `users` into the on-disk document format.
pub fn encode(users: &[(UserId, Vec<OverlayRecord>)]) -> Result<String, OverlayError> {
    let mut buf = Vec::new();
    let mut writer = Writer::new_with_indent(&mut buf, b' ', 2);

    let mut root = BytesStart::new("overlays");
    root.push_attribute(("version", DOCUMENT_VERSION));
    writer
        .write_event(Event::Start(root))
        .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;

    for (user_id, records) in users {
        let mut user_el = BytesStart::new("user");
        let id_str = user_id.to_string();
        user_el.push_attribute(("id", id_str.as_str()));
        writer
            .write_event(Event::Start(user_el))
            .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;

        let mut by_target: Vec<(String, Vec<&OverlayRecord>)> = Vec::new();
        for record in records {
            match by_target.iter_mut().find(|(t, _)| *t == record.target_package) {
                Some((_, list)) => list.push(record),
                None => by_target.push((record.target_package.clone(), vec![record])),
            }
        }

        for (target, overlays) in by_target {
            let mut target_el = BytesStart::new("target");
            target_el.push_attribute(("name", target.as_str()));
            writer
                .write_event(Event::Start(target_el))
                .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;

            for overlay in overlays {
                let mut overlay_el = BytesStart::new("overlay");
                overlay_el.push_attribute(("package", overlay.overlay_package.as_str()));
                overlay_el.push_attribute(("path", overlay.base_code_path.as_str()));
                let state_str = overlay.state.wire_value().to_string();
                overlay_el.push_attribute(("state", state_str.as_str()));
                let system_str = overlay.is_system.to_string();
                overlay_el.push_attribute(("system", system_str.as_str()));
                let priority_str = overlay.requested_priority.to_string();
                overlay_el.push_attribute(("priority", priority_str.as_str()));
                writer
                    .write_event(Event::Empty(overlay_el))
                    .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;
            }

            writer
                .write_event(Event::End(BytesEnd::new("target")))
                .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("user")))
            .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("overlays")))
        .map_err(|e| OverlayError::PersistenceFailed(e.to_string()))?;

    String::from_utf8(buf).map_err(|e| OverlayError::PersistenceFailed(e.to_string()))
}

/// Parse a persisted document back into `(user_id, records)` pairs.
/// Malformed structure anywhere in the document — a user element with a
/// missing/invalid `id`, a target with no `name`, an overlay outside any
/// user/target, or an overlay that fails to parse — fails the whole restore
/// rather than silently discarding the offending element.
pub fn decode(document: &str) -> Result<Vec<(UserId, Vec<OverlayRecord>)>, OverlayError> {
    let mut reader = Reader::from_str(document);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut users: Vec<(UserId, Vec<OverlayRecord>)> = Vec::new();
    let mut current_user: Option<UserId> = None;
    let mut current_target: Option<String> = None;
    let mut seen_version = false;

    loop {
        match reader
            .read_event()
            .map_err(|e| OverlayError::ReadFailed(e.to_string()))?
        {
            Event::Start(e) | Event::Empty(e) => {
                let local = e.name();
                match local.as_ref() {
                    b"overlays" => {
                        let version = attr(&e, "version").unwrap_or_default();
                        if version != DOCUMENT_VERSION {
                            return Err(OverlayError::ReadFailed(format!(
                                "unsupported document version {version:?}"
                            )));
                        }
                        seen_version = true;
                    }
                    b"user" => {
                        let id = attr(&e, "id")
                            .and_then(|s| s.parse::<UserId>().ok())
                            .ok_or_else(|| {
                                OverlayError::ReadFailed(
                                    "user element with missing/invalid id".into(),
                                )
                            })?;
                        current_user = Some(id);
                        if !users.iter().any(|(u, _)| *u == id) {
                            users.push((id, Vec::new()));
                        }
                    }
                    b"target" => {
                        let name = attr(&e, "name").ok_or_else(|| {
                            OverlayError::ReadFailed("target element with missing name".into())
                        })?;
                        current_target = Some(name);
                    }
                    b"overlay" => {
                        let (Some(user_id), Some(target)) = (current_user, current_target.clone())
                        else {
                            return Err(OverlayError::ReadFailed(
                                "overlay element outside any user/target".into(),
                            ));
                        };
                        let record = parse_overlay(&e, user_id, &target).ok_or_else(|| {
                            OverlayError::ReadFailed("malformed overlay element".into())
                        })?;
                        if let Some((_, list)) = users.iter_mut().find(|(u, _)| *u == user_id) {
                            list.push(record);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"user" => current_user = None,
                b"target" => current_target = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_version {
        return Err(OverlayError::ReadFailed(
            "document missing <overlays version=...> root".into(),
        ));
    }

    Ok(users)
}

fn attr(start: &BytesStart, name: &str) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|a| a.key == QName(name.as_bytes()))
        .and_then(|a| a.unescape_value().ok())
        .map(|s| s.into_owned())
}

fn parse_overlay(start: &BytesStart, user_id: UserId, target: &str) -> Option<OverlayRecord> {
    let package = attr(start, "package")?;
    let path = attr(start, "path")?;
    let state = attr(start, "state")?.parse::<u32>().ok()?;
    let state = ApprovalState::from_wire_value(state)?;
    let is_system = attr(start, "system")?.parse::<bool>().ok()?;
    let priority = attr(start, "priority")?.parse::<i32>().ok()?;
    Some(OverlayRecord::new(
        package, target, path, state, user_id, is_system, priority,
    ))
}

/// Single-slot, coalescing background persistence worker.
///
/// Each call to [`StateCodec::request_flush`] overwrites the pending
/// snapshot; the worker task always writes the most recent snapshot, never a
/// backlog of stale ones.
pub struct StateCodec {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Vec<(UserId, Vec<OverlayRecord>)>>,
    idle: watch::Receiver<bool>,
}

impl StateCodec {
    pub fn spawn() -> Self {
        Self::spawn_at(PathBuf::from(config::STATE_FILE_PATH))
    }

    pub fn spawn_at(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<(UserId, Vec<OverlayRecord>)>>();
        let (idle_tx, idle_rx) = watch::channel(true);
        let worker_path = path.clone();
        tokio::spawn(async move {
            while let Some(mut latest) = rx.recv().await {
                let _ = idle_tx.send(false);
                while let Ok(newer) = rx.try_recv() {
                    latest = newer;
                }
                if let Err(e) = write_document(&worker_path, &latest) {
                    warn!("failed to persist overlay registry: {e}");
                } else {
                    debug!("persisted overlay registry to {worker_path:?}");
                }
                let _ = idle_tx.send(true);
            }
        });
        StateCodec {
            path,
            tx,
            idle: idle_rx,
        }
    }

    /// Queue `users` for asynchronous persistence. Never blocks.
    pub fn request_flush(&self, users: Vec<(UserId, Vec<OverlayRecord>)>) {
        if self.tx.send(users).is_err() {
            warn!("persistence worker has shut down; snapshot dropped");
        }
    }

    /// Wait for the worker to finish whatever write is in flight or queued.
    /// Used at shutdown so the daemon does not exit before the last state
    /// change reaches disk.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Load the persisted document at startup. A missing file is treated as
    /// an empty registry (first boot); any other failure is surfaced.
    pub fn restore(&self) -> Result<Vec<(UserId, Vec<OverlayRecord>)>, OverlayError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let document = fs_read(&self.path)?;
        decode(&document)
    }
}

fn write_document(path: &Path, users: &[(UserId, Vec<OverlayRecord>)]) -> Result<(), OverlayError> {
    let document = encode(users)?;
    if let Some(parent) = path.parent() {
        fs_create_dir(parent)?;
    }
    let tmp = path.with_extension("xml.tmp");
    fs_write(&tmp, true, &document)?;
    fs_replace(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ApprovalState;
    use googletest::prelude::*;

    fn overlay(pkg: &str, target: &str, user: UserId) -> OverlayRecord {
        OverlayRecord::new(
            pkg,
            target,
            format!("/data/app/{pkg}/base.apk"),
            ApprovalState::ApprovedEnabled,
            user,
            false,
            0,
        )
    }

    #[gtest]
    fn encode_then_decode_round_trips_a_single_record() {
        let users = vec![(0, vec![overlay("com.ov", "com.tgt", 0)])];
        let document = encode(&users).unwrap();
        let decoded = decode(&document).unwrap();
        expect_eq!(decoded, users);
    }

    #[gtest]
    fn decode_rejects_unknown_version() {
        let document = r#"<overlays version="2"></overlays>"#;
        assert_that!(decode(document), err(anything()));
    }

    #[gtest]
    fn decode_fails_whole_restore_on_orphaned_overlay_outside_any_user() {
        let document = r#"<overlays version="1"><target name="com.tgt"><overlay package="com.ov" path="/x" state="1" system="false" priority="0"/></target></overlays>"#;
        assert_that!(decode(document), err(anything()));
    }

    #[gtest]
    fn decode_fails_whole_restore_on_overlay_with_unknown_state() {
        let document = r#"<overlays version="1"><user id="0"><target name="com.tgt"><overlay package="com.ov" path="/x" state="99" system="false" priority="0"/></target></user></overlays>"#;
        assert_that!(decode(document), err(anything()));
    }

    #[gtest]
    fn decode_fails_whole_restore_on_invalid_user_id() {
        let document = r#"<overlays version="1"><user id="not-a-number"></user></overlays>"#;
        assert_that!(decode(document), err(anything()));
    }

    #[gtest]
    fn decode_fails_whole_restore_on_target_missing_name() {
        let document = r#"<overlays version="1"><user id="0"><target></target></user></overlays>"#;
        assert_that!(decode(document), err(anything()));
    }

    #[gtest]
    fn encode_handles_multiple_users_and_targets() {
        let users = vec![
            (0, vec![overlay("com.a", "com.tgt1", 0)]),
            (10, vec![overlay("com.b", "com.tgt2", 10)]),
        ];
        let document = encode(&users).unwrap();
        let decoded = decode(&document).unwrap();
        expect_eq!(decoded.len(), 2);
    }

    #[tokio::test]
    async fn restore_returns_empty_when_file_absent() {
        let codec = StateCodec::spawn_at(PathBuf::from("/nonexistent/overlay/state/path.xml"));
        let restored = codec.restore().unwrap();
        assert!(restored.is_empty());
    }
}
