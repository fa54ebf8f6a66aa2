// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMware Changed Block Tracking checkpoint identifiers.

use std::fmt;

use thiserror::Error;

use crate::vsphere::VirtualDisk;

#[derive(Debug, Error)]
pub enum ChangeIdError {
    #[error("invalid change ID")]
    InvalidChangeId,

    #[error("CBT is not enabled on disk {key}")]
    CbtDisabled { key: i32 },

    #[error("unrecognized backing on disk {key}")]
    UnsupportedBacking { key: i32 },
}

/// A CBT checkpoint identifier of the form `<uuid>/<number>`.
///
/// A change in the `uuid` half means the tracking lineage on the source was
/// reset and any delta base derived from the old lineage is gone.
///
/// The empty value is a legal sentinel meaning "never copied" (or "copy
/// invalidated by guest conversion"). It is produced by [`ChangeId::empty`]
/// and by parsing an empty string, and is distinguishable from a malformed
/// identifier, which fails with [`ChangeIdError::InvalidChangeId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeId {
    pub uuid: String,
    pub number: String,
    /// The raw `uuid/number` form as VMware reported it.
    pub value: String,
}

impl ChangeId {
    /// The sentinel value recorded on a target that holds no completed copy.
    pub fn empty() -> Self {
        Self { uuid: String::new(), number: String::new(), value: String::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn parse(value: &str) -> Result<Self, ChangeIdError> {
        if value.is_empty() {
            return Ok(Self::empty());
        }

        let (uuid, number) =
            value.split_once('/').ok_or(ChangeIdError::InvalidChangeId)?;
        if uuid.is_empty() || number.is_empty() || number.contains('/') {
            return Err(ChangeIdError::InvalidChangeId);
        }

        Ok(Self {
            uuid: uuid.to_string(),
            number: number.to_string(),
            value: value.to_string(),
        })
    }

    /// Extracts the checkpoint recorded on a snapshot disk's backing.
    pub fn from_disk(disk: &VirtualDisk) -> Result<Self, ChangeIdError> {
        let raw = disk
            .backing
            .change_id()
            .ok_or(ChangeIdError::UnsupportedBacking { key: disk.key })?;
        if raw.is_empty() {
            return Err(ChangeIdError::CbtDisabled { key: disk.key });
        }
        Self::parse(raw)
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vsphere::DiskBacking;

    #[test]
    fn parse_round_trips() {
        let id = ChangeId::parse("52de3f5f-9f8b-de86-a9f0-bc2be1696b5a/42")
            .unwrap();
        assert_eq!(id.uuid, "52de3f5f-9f8b-de86-a9f0-bc2be1696b5a");
        assert_eq!(id.number, "42");
        assert_eq!(
            ChangeId::parse(&id.to_string()).unwrap(),
            id,
            "formatting then parsing must be the identity"
        );
    }

    #[test]
    fn parse_empty_is_sentinel() {
        let id = ChangeId::parse("").unwrap();
        assert!(id.is_empty());
        assert_eq!(id, ChangeId::empty());
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["a/b/c", "no-separator", "/42", "aaaa/", "/"] {
            assert!(
                matches!(
                    ChangeId::parse(bad),
                    Err(ChangeIdError::InvalidChangeId)
                ),
                "{bad:?} should not parse"
            );
        }
    }

    fn disk_with_change_id(change_id: &str) -> VirtualDisk {
        VirtualDisk {
            key: 2000,
            capacity_in_bytes: 1 << 30,
            disk_object_id: Some("6000-2000".to_string()),
            backing: DiskBacking::FlatV2 {
                file_name: "[datastore1] vm/vm.vmdk".to_string(),
                change_id: change_id.to_string(),
            },
        }
    }

    #[test]
    fn from_disk_reads_backing() {
        let disk = disk_with_change_id("aaaa/7");
        let id = ChangeId::from_disk(&disk).unwrap();
        assert_eq!(id.value, "aaaa/7");
    }

    #[test]
    fn from_disk_without_cbt_fails() {
        let disk = disk_with_change_id("");
        assert!(matches!(
            ChangeId::from_disk(&disk),
            Err(ChangeIdError::CbtDisabled { key: 2000 })
        ));
    }

    #[test]
    fn from_disk_unknown_backing_fails() {
        let disk = VirtualDisk {
            backing: DiskBacking::Unknown {
                kind: "VirtualDiskSeSparseBackingInfo".to_string(),
            },
            ..disk_with_change_id("aaaa/7")
        };
        assert!(matches!(
            ChangeId::from_disk(&disk),
            Err(ChangeIdError::UnsupportedBacking { key: 2000 })
        ));
    }
}
