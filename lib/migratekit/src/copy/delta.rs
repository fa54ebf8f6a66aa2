// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CBT-driven delta replication.
//!
//! For every region `QueryChangedDiskAreas` reports as modified since the
//! persisted checkpoint, bytes are read from the snapshot's NBD export and
//! written to the destination at the same offset. The destination is
//! opened exclusive with direct I/O, so writes go through a page-aligned
//! buffer and regions are copied in chunks of at most [`MAX_CHUNK_SIZE`].

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::OpenOptions;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::sync::Arc;

use camino::Utf8Path;
use slog::{debug, Logger};

use super::CopyError;
use crate::change_id::ChangeId;
use crate::nbd;
use crate::progress::{emit_bytes, ProgressSink};
use crate::vsphere::{Client, ManagedObjectReference, VirtualDisk};

/// Largest single NBD read / destination write.
pub const MAX_CHUNK_SIZE: i64 = 64 * 1024 * 1024;

/// Direct I/O wants the buffer aligned to at least the logical sector
/// size; page alignment satisfies every block layer we attach to.
const BUFFER_ALIGN: usize = 4096;

/// Copies the regions changed since `current` from the export at
/// `source` onto `destination`.
pub async fn run(
    client: &Client,
    vm: &ManagedObjectReference,
    snapshot: &ManagedObjectReference,
    disk: &VirtualDisk,
    current: &ChangeId,
    source: &str,
    destination: &Utf8Path,
    progress: Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), CopyError> {
    let mut handle = nbd::Client::connect_uri(source).await?;

    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_EXCL | libc::O_DIRECT)
        .open(destination)?;

    let capacity = disk.capacity_in_bytes;
    let mut buf = AlignedBuf::new(MAX_CHUNK_SIZE as usize);
    let mut start_offset: i64 = 0;

    loop {
        let info = client
            .query_changed_disk_areas(
                vm,
                snapshot,
                disk.key,
                start_offset,
                &current.value,
            )
            .await?;

        for area in &info.changed_area {
            debug!(log, "copying changed area";
                "start" => area.start, "length" => area.length);
            let mut offset = area.start;
            while offset < area.start + area.length {
                let chunk = (area.length - (offset - area.start))
                    .min(MAX_CHUNK_SIZE) as usize;
                let chunk_buf = &mut buf.as_mut_slice()[..chunk];
                handle.pread(chunk_buf, offset as u64).await?;
                let file = &file;
                tokio::task::block_in_place(|| {
                    file.write_all_at(chunk_buf, offset as u64)
                })?;
                offset += chunk as i64;
                emit_bytes(
                    progress.as_ref(),
                    "Incremental copy",
                    offset.min(capacity) as u64,
                    capacity as u64,
                );
            }
        }

        // The next query resumes where this reply's window ended, even
        // when the reply reported no changed areas inside it.
        start_offset = info.start_offset + info.length;
        emit_bytes(
            progress.as_ref(),
            "Incremental copy",
            start_offset.min(capacity) as u64,
            capacity as u64,
        );

        if start_offset == capacity {
            break;
        }
    }

    let _ = handle.shutdown().await;
    Ok(())
}

/// A heap buffer aligned for direct I/O.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

// The raw pointer is owned exclusively by this buffer.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let layout = Layout::from_size_align(len, BUFFER_ALIGN)
            .expect("chunk size and alignment are valid");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation of copy buffer failed");
        Self { ptr, layout }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr, self.layout.size())
        }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aligned_buffer_is_aligned() {
        let mut buf = AlignedBuf::new(1 << 20);
        assert_eq!(buf.as_mut_slice().as_ptr() as usize % BUFFER_ALIGN, 0);
        assert_eq!(buf.as_mut_slice().len(), 1 << 20);
        buf.as_mut_slice()[0] = 0xaa;
        buf.as_mut_slice()[(1 << 20) - 1] = 0x55;
    }

    /// Mirrors the inner loop's chunking arithmetic so the bound can be
    /// checked without a live export.
    fn chunk_sizes(area_start: i64, area_length: i64) -> Vec<i64> {
        let mut sizes = Vec::new();
        let mut offset = area_start;
        while offset < area_start + area_length {
            let chunk =
                (area_length - (offset - area_start)).min(MAX_CHUNK_SIZE);
            sizes.push(chunk);
            offset += chunk;
        }
        sizes
    }

    #[test]
    fn chunks_never_exceed_the_bound() {
        // A region larger than three chunks splits with a short tail.
        let sizes = chunk_sizes(0, 3 * MAX_CHUNK_SIZE + 4096);
        assert_eq!(
            sizes,
            vec![MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_CHUNK_SIZE, 4096]
        );
        assert!(sizes.iter().all(|s| *s <= MAX_CHUNK_SIZE));

        // Small regions stay whole, offsets inside the disk don't matter.
        assert_eq!(chunk_sizes(1 << 30, 65536), vec![65536]);

        // The chunk sum always equals the region length.
        let total: i64 = chunk_sizes(512, 5 * MAX_CHUNK_SIZE - 1).iter().sum();
        assert_eq!(total, 5 * MAX_CHUNK_SIZE - 1);
    }
}
