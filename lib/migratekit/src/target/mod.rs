// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The destination for one source disk.
//!
//! A target outlives snapshot sessions; the change-ID it persists is the
//! only authoritative record of what it contains and is the hand-off
//! between cycles.

mod local;
mod openstack;

use camino::Utf8PathBuf;
use thiserror::Error;

pub use local::LocalDisk;
pub use openstack::{
    volume_for_disk, BusType, OpenStackTarget, OsType, VolumeCreateOpts,
};

use crate::change_id::{ChangeId, ChangeIdError};
use crate::openstack::OpenstackError;
use crate::vsphere::VirtualDisk;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("OpenStack request failed")]
    Openstack(#[from] OpenstackError),

    #[error("persisted change ID is unusable")]
    ChangeId(#[from] ChangeIdError),

    #[error("timed out waiting for the device node of volume {volume}")]
    AttachTimeout { volume: uuid::Uuid },

    #[error("target I/O error")]
    Io(#[from] std::io::Error),

    #[error("target metadata is not valid JSON")]
    Metadata(#[from] serde_json::Error),
}

/// One destination disk, either a cinder volume attached to this host or a
/// raw file on a local filesystem.
pub enum Target {
    OpenStack(OpenStackTarget),
    Local(LocalDisk),
}

impl Target {
    pub fn disk(&self) -> &VirtualDisk {
        match self {
            Target::OpenStack(t) => t.disk(),
            Target::Local(t) => t.disk(),
        }
    }

    /// Makes the destination reachable: creates the backing if it does not
    /// exist and (for volumes) attaches it to this host.
    pub async fn connect(&self) -> Result<(), TargetError> {
        match self {
            Target::OpenStack(t) => t.connect().await,
            Target::Local(t) => t.connect().await,
        }
    }

    /// The writable path, or an empty path when a volume exists but is not
    /// attached yet.
    pub async fn path(&self) -> Result<Utf8PathBuf, TargetError> {
        match self {
            Target::OpenStack(t) => t.path().await,
            Target::Local(t) => Ok(t.path()),
        }
    }

    pub async fn disconnect(&self) -> Result<(), TargetError> {
        match self {
            Target::OpenStack(t) => t.disconnect().await,
            Target::Local(_) => Ok(()),
        }
    }

    pub async fn exists(&self) -> Result<bool, TargetError> {
        match self {
            Target::OpenStack(t) => t.exists().await,
            Target::Local(t) => t.exists(),
        }
    }

    /// The persisted checkpoint; the sentinel when the destination has
    /// never completed a pass (or does not exist yet).
    pub async fn current_change_id(&self) -> Result<ChangeId, TargetError> {
        match self {
            Target::OpenStack(t) => t.current_change_id().await,
            Target::Local(t) => t.current_change_id(),
        }
    }

    /// Persists a new checkpoint. Writing to a destination that has
    /// disappeared is a no-op.
    pub async fn write_change_id(
        &self,
        change_id: &ChangeId,
    ) -> Result<(), TargetError> {
        match self {
            Target::OpenStack(t) => t.write_change_id(change_id).await,
            Target::Local(t) => t.write_change_id(change_id),
        }
    }
}

/// The slugified `<vm>-<disk key>` label shared by volume names and local
/// file layouts.
pub(crate) fn disk_label(vm_name: &str, disk: &VirtualDisk) -> String {
    slug::slugify(format!("{}-{}", vm_name, disk.key))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vsphere::DiskBacking;

    #[test]
    fn labels_are_slugs() {
        let disk = VirtualDisk {
            key: 2000,
            capacity_in_bytes: 1,
            disk_object_id: None,
            backing: DiskBacking::Unknown { kind: String::new() },
        };
        assert_eq!(disk_label("My Guest VM", &disk), "my-guest-vm-2000");
        assert_eq!(disk_label("db01.prod", &disk), "db01-prod-2000");
    }
}
