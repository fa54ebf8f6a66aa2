// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A cinder volume attached to the migrator's own instance.
//!
//! Volumes are identified by a slugified `<vm>-<disk key>` name plus
//! marker metadata; an older deployment's metadata shape is still looked
//! up as a fallback. The persisted change-ID lives in the volume metadata
//! under `change_id`.

use std::collections::BTreeMap;
use std::time::Duration;

use camino::Utf8PathBuf;
use slog::{info, warn, Logger};
use std::sync::Arc;
use uuid::Uuid;

use super::{disk_label, TargetError};
use crate::change_id::ChangeId;
use crate::openstack::{self, ClientSet, OpenstackError, Volume};
use crate::vsphere::{Firmware, VirtualDisk, VmFacts};

const VOLUME_STATUS_TIMEOUT: Duration = Duration::from_secs(60);
const DEVICE_TIMEOUT: Duration = Duration::from_secs(120);
const DEVICE_POLL: Duration = Duration::from_secs(1);

/// Cinder volumes attach under /dev/disk/by-id with a serial derived from
/// a truncated volume UUID; this much of it is unambiguous.
const DEVICE_ID_PREFIX_LEN: usize = 18;

/// How created volumes are sized and where they land.
#[derive(Debug, Clone, Default)]
pub struct VolumeCreateOpts {
    pub availability_zone: Option<String>,
    pub volume_type: Option<String>,
    pub bus_type: BusType,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum BusType {
    #[default]
    Virtio,
    Scsi,
}

/// The `os_type` image property stamped on created volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsType {
    /// Derive from the VMware guest ID.
    Auto,
    Named(String),
}

pub struct OpenStackTarget {
    clients: Arc<ClientSet>,
    vm: VmFacts,
    disk: VirtualDisk,
    create_opts: VolumeCreateOpts,
    os_type: Option<OsType>,
    unsafe_volume_by_name: bool,
    log: Logger,
}

impl OpenStackTarget {
    pub fn new(
        clients: Arc<ClientSet>,
        vm: VmFacts,
        disk: VirtualDisk,
        create_opts: VolumeCreateOpts,
        os_type: Option<OsType>,
        unsafe_volume_by_name: bool,
        log: &Logger,
    ) -> Self {
        let log = log.new(slog::o!("disk" => disk.key));
        Self {
            clients,
            vm,
            disk,
            create_opts,
            os_type,
            unsafe_volume_by_name,
            log,
        }
    }

    pub fn disk(&self) -> &VirtualDisk {
        &self.disk
    }

    async fn volume(&self) -> Result<Volume, TargetError> {
        volume_for_disk(
            &self.clients,
            &self.vm,
            &self.disk,
            self.unsafe_volume_by_name,
            &self.log,
        )
        .await
    }

    pub async fn connect(&self) -> Result<(), TargetError> {
        let volume = match self.volume().await {
            Ok(volume) => volume,
            Err(TargetError::Openstack(OpenstackError::VolumeNotFound)) => {
                self.create_volume().await?
            }
            Err(e) => return Err(e),
        };

        if find_device(&volume.id)?.is_some() {
            return Ok(());
        }

        let instance_uuid = openstack::current_instance_uuid().await?;
        info!(self.log, "attaching volume";
            "volume_id" => %volume.id, "instance_uuid" => &instance_uuid);
        self.clients.attach_volume(&instance_uuid, volume.id).await?;

        let deadline = tokio::time::Instant::now() + DEVICE_TIMEOUT;
        loop {
            if let Some(device) = find_device(&volume.id)? {
                info!(self.log, "device found";
                    "volume_id" => %volume.id, "device" => device.as_str());
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TargetError::AttachTimeout { volume: volume.id });
            }
            tokio::time::sleep(DEVICE_POLL).await;
        }
    }

    async fn create_volume(&self) -> Result<Volume, TargetError> {
        info!(self.log, "creating new volume");

        let mut metadata = self.identifying_metadata();
        if self.create_opts.bus_type == BusType::Scsi {
            metadata.insert("hw_disk_bus".to_string(), "scsi".to_string());
            metadata.insert(
                "hw_scsi_model".to_string(),
                "virtio-scsi".to_string(),
            );
        }

        let gib = 1i64 << 30;
        let size_gib = (self.disk.capacity_in_bytes + gib - 1) / gib;
        let volume = self
            .clients
            .create_volume(
                &disk_label(&self.vm.name, &self.disk),
                size_gib,
                self.create_opts.availability_zone.as_deref(),
                self.create_opts.volume_type.as_deref(),
                metadata,
            )
            .await?;
        self.clients
            .wait_for_volume_status(
                volume.id,
                "available",
                VOLUME_STATUS_TIMEOUT,
            )
            .await?;

        info!(self.log, "volume created, setting to bootable";
            "volume_id" => %volume.id);
        self.clients.set_volume_bootable(volume.id).await?;

        let mut image_metadata = BTreeMap::new();
        if let Some(os_type) = self.resolved_os_type() {
            info!(self.log, "volume os type";
                "volume_id" => %volume.id, "os_type" => &os_type);
            image_metadata.insert("os_type".to_string(), os_type);
        }
        if self.vm.firmware == Firmware::Efi {
            info!(self.log, "setting volume to be UEFI";
                "volume_id" => %volume.id);
            image_metadata
                .insert("hw_machine_type".to_string(), "q35".to_string());
            image_metadata
                .insert("hw_firmware_type".to_string(), "uefi".to_string());
        }
        self.clients
            .set_volume_image_metadata(volume.id, &image_metadata)
            .await?;

        Ok(volume)
    }

    fn identifying_metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("migrate_kit".to_string(), "true".to_string()),
            ("vm".to_string(), self.vm.moref.value.clone()),
            ("disk".to_string(), self.disk.key.to_string()),
        ])
    }

    fn resolved_os_type(&self) -> Option<String> {
        match &self.os_type {
            None => None,
            Some(OsType::Named(name)) => Some(name.clone()),
            Some(OsType::Auto) => {
                if self.vm.guest_id.to_lowercase().contains("windows") {
                    Some("windows".to_string())
                } else {
                    Some("linux".to_string())
                }
            }
        }
    }

    pub async fn path(&self) -> Result<Utf8PathBuf, TargetError> {
        let volume = self.volume().await?;
        Ok(find_device(&volume.id)?.unwrap_or_default())
    }

    pub async fn disconnect(&self) -> Result<(), TargetError> {
        let volume = match self.volume().await {
            Ok(volume) => volume,
            Err(TargetError::Openstack(OpenstackError::VolumeNotFound)) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        if find_device(&volume.id)?.is_some() {
            let instance_uuid = openstack::current_instance_uuid().await?;
            self.clients.detach_volume(&instance_uuid, volume.id).await?;
            self.clients
                .wait_for_volume_status(
                    volume.id,
                    "available",
                    VOLUME_STATUS_TIMEOUT,
                )
                .await?;
        }

        Ok(())
    }

    pub async fn exists(&self) -> Result<bool, TargetError> {
        match self.volume().await {
            Ok(_) => Ok(true),
            Err(TargetError::Openstack(OpenstackError::VolumeNotFound)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn current_change_id(&self) -> Result<ChangeId, TargetError> {
        let volume = match self.volume().await {
            Ok(volume) => volume,
            Err(TargetError::Openstack(OpenstackError::VolumeNotFound)) => {
                return Ok(ChangeId::empty())
            }
            Err(e) => return Err(e),
        };

        match volume.metadata.get("change_id") {
            Some(raw) => Ok(ChangeId::parse(raw)?),
            None => Ok(ChangeId::empty()),
        }
    }

    pub async fn write_change_id(
        &self,
        change_id: &ChangeId,
    ) -> Result<(), TargetError> {
        let mut volume = match self.volume().await {
            Ok(volume) => volume,
            // Nothing to record a checkpoint on; the write is meaningless.
            Err(TargetError::Openstack(OpenstackError::VolumeNotFound)) => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        volume
            .metadata
            .insert("change_id".to_string(), change_id.value.clone());
        self.clients
            .update_volume_metadata(volume.id, volume.metadata)
            .await?;
        Ok(())
    }
}

/// Finds the volume backing `disk`, by name and identifying metadata (or
/// name alone under the unsafe lookup), falling back to the legacy
/// `diskObjectId`-keyed shape. Exactly one match is required.
pub async fn volume_for_disk(
    clients: &ClientSet,
    vm: &VmFacts,
    disk: &VirtualDisk,
    unsafe_volume_by_name: bool,
    log: &Logger,
) -> Result<Volume, TargetError> {
    let metadata = BTreeMap::from([
        ("migrate_kit".to_string(), "true".to_string()),
        ("vm".to_string(), vm.moref.value.clone()),
        ("disk".to_string(), disk.key.to_string()),
    ]);

    let mut volumes = clients
        .list_volumes(
            &disk_label(&vm.name, disk),
            (!unsafe_volume_by_name).then_some(&metadata),
        )
        .await?;

    if volumes.is_empty() {
        if let Some(disk_object_id) = &disk.disk_object_id {
            let legacy_name =
                slug::slugify(format!("{}-{}", vm.name, disk_object_id));
            let legacy_metadata = BTreeMap::from([
                ("migrate_kit".to_string(), "true".to_string()),
                ("vm".to_string(), vm.moref.value.clone()),
                ("disk".to_string(), disk_object_id.clone()),
            ]);
            volumes = clients
                .list_volumes(&legacy_name, Some(&legacy_metadata))
                .await?;
            if !volumes.is_empty() {
                warn!(log,
                    "using deprecated volume name and metadata format");
            }
        }
    }

    match volumes.len() {
        0 => Err(OpenstackError::VolumeNotFound.into()),
        1 => Ok(clients.get_volume(volumes[0].id).await?),
        _ => Err(OpenstackError::AmbiguousVolume.into()),
    }
}

/// Scans /dev/disk/by-id for an entry naming the volume and resolves it to
/// the real device node. `None` when the volume is not attached yet.
fn find_device(volume_id: &Uuid) -> Result<Option<Utf8PathBuf>, TargetError> {
    let id = volume_id.to_string();
    let prefix = &id[..DEVICE_ID_PREFIX_LEN];

    let entries = match std::fs::read_dir("/dev/disk/by-id") {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().contains(prefix) {
            let device = std::fs::canonicalize(entry.path())?;
            return Ok(Some(
                Utf8PathBuf::from_path_buf(device)
                    .unwrap_or_default(),
            ));
        }
    }
    Ok(None)
}
