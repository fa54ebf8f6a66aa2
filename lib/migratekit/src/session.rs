// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ephemeral snapshot a cycle replicates from, and the block servers
//! that export its disks.
//!
//! The session owns every server it spawned: stopping the session stops
//! them all and then removes the snapshot (with consolidation), and an
//! interrupt while the session is open runs the same teardown before the
//! process exits. Stop is idempotent, so the signal path and the normal
//! path can race safely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use slog::{error, info, Logger};
use thiserror::Error;

use crate::nbdkit::{NbdkitBuilder, NbdkitError, NbdkitServer};
use crate::progress::ProgressSink;
use crate::signal::SignalGuard;
use crate::vsphere::{Client, ManagedObjectReference, VirtualDisk, VsphereError};

pub const SNAPSHOT_NAME: &str = "migratekit";
const SNAPSHOT_DESCRIPTION: &str = "Ephemeral snapshot for MigrateKit";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("vSphere request failed")]
    Vsphere(#[from] VsphereError),

    #[error("block server failed")]
    Nbdkit(#[from] NbdkitError),

    #[error("snapshot task returned no reference")]
    MissingSnapshotRef,

    #[error("disk {key} has no backing file to export")]
    MissingBackingFile { key: i32 },
}

/// Connection parameters for the VDDK transport, shared by every block
/// server of a session.
#[derive(Clone, Debug)]
pub struct VddkConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub thumbprint: String,
    pub compression: crate::nbdkit::Compression,
    pub debug: bool,
}

/// One snapshot disk and the URI its block server exports it under.
#[derive(Clone, Debug)]
pub struct DiskExport {
    pub disk: VirtualDisk,
    pub export_uri: String,
}

struct SessionInner {
    client: Arc<Client>,
    vm: ManagedObjectReference,
    snapshot: ManagedObjectReference,
    servers: tokio::sync::Mutex<Vec<(VirtualDisk, NbdkitServer)>>,
    stopped: AtomicBool,
    sink: Arc<dyn ProgressSink>,
    log: Logger,
}

pub struct SnapshotSession {
    inner: Arc<SessionInner>,
    _signal_guard: SignalGuard,
}

impl SnapshotSession {
    /// Creates the snapshot, spawns one block server per disk and arms the
    /// interrupt handler. On any failure the snapshot is removed again
    /// before the error propagates.
    pub async fn start(
        client: Arc<Client>,
        vm: &ManagedObjectReference,
        vddk: &VddkConfig,
        sink: Arc<dyn ProgressSink>,
        log: &Logger,
    ) -> Result<Self, SessionError> {
        info!(log, "creating snapshot"; "vm" => %vm);
        let task = client
            .create_snapshot(
                vm,
                SNAPSHOT_NAME,
                SNAPSHOT_DESCRIPTION,
                false,
                false,
            )
            .await?;
        let snapshot = client
            .wait_for_task(&task, sink.as_ref(), "Creating snapshot")
            .await?
            .ok_or(SessionError::MissingSnapshotRef)?;

        let inner = Arc::new(SessionInner {
            client,
            vm: vm.clone(),
            snapshot,
            servers: tokio::sync::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            sink,
            log: log.clone(),
        });

        if let Err(e) = inner.spawn_servers(vddk).await {
            if let Err(stop_err) = inner.stop().await {
                error!(log, "failed to tear down after startup error";
                    "error" => %stop_err);
            }
            return Err(e);
        }

        let guard_inner = Arc::clone(&inner);
        let guard_log = log.clone();
        let signal_guard = SignalGuard::install(log, async move {
            if let Err(e) = guard_inner.stop().await {
                error!(guard_log, "failed to stop snapshot session";
                    "error" => %e);
            }
        });

        Ok(Self { inner, _signal_guard: signal_guard })
    }

    pub fn vm(&self) -> &ManagedObjectReference {
        &self.inner.vm
    }

    pub fn snapshot(&self) -> &ManagedObjectReference {
        &self.inner.snapshot
    }

    /// The disks of this snapshot, in device order, with their export
    /// URIs.
    pub async fn exports(&self) -> Vec<DiskExport> {
        self.inner
            .servers
            .lock()
            .await
            .iter()
            .map(|(disk, server)| DiskExport {
                disk: disk.clone(),
                export_uri: server.export_uri(),
            })
            .collect()
    }

    /// Stops every block server, then removes the snapshot with
    /// consolidation. Idempotent.
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.inner.stop().await
    }
}

impl SessionInner {
    async fn spawn_servers(
        &self,
        vddk: &VddkConfig,
    ) -> Result<(), SessionError> {
        let disks = self.client.hardware_disks(&self.snapshot).await?;
        for disk in disks {
            let file_name = disk
                .backing
                .file_name()
                .ok_or(SessionError::MissingBackingFile { key: disk.key })?;

            let server = NbdkitBuilder::new()
                .server(&vddk.host)
                .username(&vddk.username)
                .password(&vddk.password)
                .thumbprint(&vddk.thumbprint)
                .virtual_machine(&self.vm.value)
                .snapshot(&self.snapshot.value)
                .filename(file_name)
                .compression(vddk.compression)
                .spawn(&self.log)
                .await?;

            self.servers.lock().await.push((disk, server));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), SessionError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let servers = std::mem::take(&mut *self.servers.lock().await);
        for (_, server) in servers {
            server.stop(&self.log).await?;
        }

        info!(self.log, "removing snapshot"; "snapshot" => %self.snapshot);
        let task =
            self.client.remove_snapshot(&self.snapshot, true).await?;
        self.client
            .wait_for_task(&task, self.sink.as_ref(), "Removing snapshot")
            .await?;
        Ok(())
    }
}
