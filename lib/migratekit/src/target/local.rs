// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A raw file destination under a local base directory, with the
//! persisted change-ID in a JSON sidecar next to it.

use std::io::{Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{info, Logger};

use super::TargetError;
use crate::change_id::ChangeId;
use crate::vsphere::VirtualDisk;

#[derive(Debug, Serialize, Deserialize)]
struct DiskMetadata {
    change_id: String,
    vm_name: String,
    disk_key: i32,
    size: i64,
}

pub struct LocalDisk {
    base: Utf8PathBuf,
    vm_name: String,
    disk: VirtualDisk,
    log: Logger,
}

impl LocalDisk {
    pub fn new(
        base: &Utf8Path,
        vm_name: &str,
        disk: VirtualDisk,
        log: &Logger,
    ) -> Self {
        Self {
            base: base.to_path_buf(),
            vm_name: vm_name.to_string(),
            disk,
            log: log.clone(),
        }
    }

    pub fn disk(&self) -> &VirtualDisk {
        &self.disk
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.vm_dir().join(format!("disk-{}.raw", self.disk.key))
    }

    fn metadata_path(&self) -> Utf8PathBuf {
        self.vm_dir().join(format!("disk-{}.metadata.json", self.disk.key))
    }

    fn vm_dir(&self) -> Utf8PathBuf {
        self.base.join(self.vm_name.replace('/', "_"))
    }

    /// Creates the backing file pre-sized to the disk's capacity. The file
    /// stays sparse; only the final byte is forced to exist.
    pub async fn connect(&self) -> Result<(), TargetError> {
        let path = self.path();
        std::fs::create_dir_all(self.vm_dir())?;

        if !path.exists() {
            let mut file = std::fs::File::create(&path)?;
            file.seek(SeekFrom::Start(
                (self.disk.capacity_in_bytes - 1) as u64,
            ))?;
            file.write_all(&[0])?;
            info!(self.log, "created target file";
                "file" => path.as_str(),
                "size" => self.disk.capacity_in_bytes);
        }

        Ok(())
    }

    pub fn exists(&self) -> Result<bool, TargetError> {
        Ok(self.path().exists())
    }

    pub fn current_change_id(&self) -> Result<ChangeId, TargetError> {
        let metadata_path = self.metadata_path();
        if !metadata_path.exists() {
            return Ok(ChangeId::empty());
        }

        let data = std::fs::read(&metadata_path)?;
        let metadata: DiskMetadata = serde_json::from_slice(&data)?;
        Ok(ChangeId::parse(&metadata.change_id)?)
    }

    pub fn write_change_id(
        &self,
        change_id: &ChangeId,
    ) -> Result<(), TargetError> {
        let metadata_path = self.metadata_path();
        let metadata = DiskMetadata {
            change_id: change_id.value.clone(),
            vm_name: self.vm_name.clone(),
            disk_key: self.disk.key,
            size: self.disk.capacity_in_bytes,
        };

        std::fs::create_dir_all(self.vm_dir())?;
        std::fs::write(
            &metadata_path,
            serde_json::to_vec_pretty(&metadata)?,
        )?;
        info!(self.log, "wrote change ID";
            "metadata_file" => metadata_path.as_str(),
            "change_id" => &change_id.value);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vsphere::DiskBacking;

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn test_disk() -> VirtualDisk {
        VirtualDisk {
            key: 2000,
            capacity_in_bytes: 1 << 20,
            disk_object_id: None,
            backing: DiskBacking::FlatV2 {
                file_name: "[ds1] guest/guest.vmdk".to_string(),
                change_id: "aaaa/9".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn connect_presizes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let target = LocalDisk::new(base, "guest", test_disk(), &test_log());

        assert!(!target.exists().unwrap());
        target.connect().await.unwrap();
        assert!(target.exists().unwrap());

        let len =
            std::fs::metadata(target.path()).unwrap().len();
        assert_eq!(len, 1 << 20);
        assert_eq!(
            target.path(),
            base.join("guest").join("disk-2000.raw")
        );
    }

    #[tokio::test]
    async fn change_id_round_trips_through_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let target = LocalDisk::new(base, "guest", test_disk(), &test_log());

        // No sidecar yet: the sentinel.
        assert!(target.current_change_id().unwrap().is_empty());

        let id = ChangeId::parse("aaaa/9").unwrap();
        target.write_change_id(&id).unwrap();
        assert_eq!(target.current_change_id().unwrap(), id);

        // A reset marker reads back as the sentinel, not an error.
        target.write_change_id(&ChangeId::empty()).unwrap();
        assert!(target.current_change_id().unwrap().is_empty());

        let raw: serde_json::Value = serde_json::from_slice(
            &std::fs::read(target.metadata_path()).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["vm_name"], "guest");
        assert_eq!(raw["disk_key"], 2000);
        assert_eq!(raw["size"], 1 << 20);
    }

    #[test]
    fn vm_names_with_separators_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let target =
            LocalDisk::new(base, "dc/guest", test_disk(), &test_log());
        assert_eq!(
            target.path(),
            base.join("dc_guest").join("disk-2000.raw")
        );
    }
}
