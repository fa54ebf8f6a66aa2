// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed views of the vim25 managed objects the migrator touches.

use std::fmt;

const XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// A reference to a server-side managed object, e.g. `VirtualMachine:vm-42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedObjectReference {
    pub kind: String,
    pub value: String,
}

impl ManagedObjectReference {
    pub fn new(kind: &str, value: &str) -> Self {
        Self { kind: kind.to_string(), value: value.to_string() }
    }

    pub(crate) fn from_node(node: roxmltree::Node) -> Option<Self> {
        let kind = node.attribute("type")?;
        let value = node.text()?;
        Some(Self::new(kind, value))
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// The backing variants that carry a CBT change ID. Anything else is
/// surfaced as `Unknown` so the caller can fail with the disk key in hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskBacking {
    FlatV2 { file_name: String, change_id: String },
    SparseV2 { file_name: String, change_id: String },
    RawDiskMappingV1 { file_name: String, change_id: String },
    RawDiskV2 { descriptor_file_name: String, change_id: String },
    Unknown { kind: String },
}

impl DiskBacking {
    /// The datastore path served by the VDDK transport for this backing.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            DiskBacking::FlatV2 { file_name, .. }
            | DiskBacking::SparseV2 { file_name, .. }
            | DiskBacking::RawDiskMappingV1 { file_name, .. } => {
                Some(file_name)
            }
            DiskBacking::RawDiskV2 { descriptor_file_name, .. } => {
                Some(descriptor_file_name)
            }
            DiskBacking::Unknown { .. } => None,
        }
    }

    /// The raw change ID string, possibly empty when CBT is disabled.
    pub fn change_id(&self) -> Option<&str> {
        match self {
            DiskBacking::FlatV2 { change_id, .. }
            | DiskBacking::SparseV2 { change_id, .. }
            | DiskBacking::RawDiskMappingV1 { change_id, .. }
            | DiskBacking::RawDiskV2 { change_id, .. } => Some(change_id),
            DiskBacking::Unknown { .. } => None,
        }
    }

    fn from_node(node: roxmltree::Node) -> Self {
        let kind = xsi_type(node).unwrap_or_default();
        let change_id =
            child_text(node, "changeId").unwrap_or_default().to_string();
        let file_name =
            child_text(node, "fileName").unwrap_or_default().to_string();
        match kind {
            "VirtualDiskFlatVer2BackingInfo" => {
                DiskBacking::FlatV2 { file_name, change_id }
            }
            "VirtualDiskSparseVer2BackingInfo" => {
                DiskBacking::SparseV2 { file_name, change_id }
            }
            "VirtualDiskRawDiskMappingVer1BackingInfo" => {
                DiskBacking::RawDiskMappingV1 { file_name, change_id }
            }
            "VirtualDiskRawDiskVer2BackingInfo" => DiskBacking::RawDiskV2 {
                descriptor_file_name: child_text(node, "descriptorFileName")
                    .unwrap_or_default()
                    .to_string(),
                change_id,
            },
            other => DiskBacking::Unknown { kind: other.to_string() },
        }
    }
}

/// One virtual disk of a snapshot's device list. Immutable for the lifetime
/// of the snapshot it was enumerated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDisk {
    pub key: i32,
    pub capacity_in_bytes: i64,
    pub disk_object_id: Option<String>,
    pub backing: DiskBacking,
}

impl VirtualDisk {
    /// Builds a disk from a `config.hardware.device` array element, or
    /// `None` when the device is not a `VirtualDisk`.
    pub(crate) fn from_device_node(node: roxmltree::Node) -> Option<Self> {
        if xsi_type(node) != Some("VirtualDisk") {
            return None;
        }
        let key = child_text(node, "key")?.parse().ok()?;
        let capacity_in_bytes =
            child_text(node, "capacityInBytes")?.parse().ok()?;
        let backing = node
            .children()
            .find(|n| is_elem(*n, "backing"))
            .map(DiskBacking::from_node)
            .unwrap_or(DiskBacking::Unknown { kind: String::new() });
        Some(Self {
            key,
            capacity_in_bytes,
            disk_object_id: child_text(node, "diskObjectId")
                .map(str::to_string),
            backing,
        })
    }
}

/// One changed region of a disk, relative to the start of the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedDiskArea {
    pub start: i64,
    pub length: i64,
}

/// Reply of one `QueryChangedDiskAreas` round trip. `start_offset` plus
/// `length` is where the next query resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskChangeInfo {
    pub start_offset: i64,
    pub length: i64,
    pub changed_area: Vec<ChangedDiskArea>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub(crate) fn from_vim(s: &str) -> Option<Self> {
        match s {
            "poweredOn" => Some(PowerState::PoweredOn),
            "poweredOff" => Some(PowerState::PoweredOff),
            "suspended" => Some(PowerState::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Efi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

impl TaskState {
    pub(crate) fn from_vim(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "success" => Some(TaskState::Success),
            "error" => Some(TaskState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub state: TaskState,
    pub progress: Option<i32>,
    pub result: Option<ManagedObjectReference>,
    pub error: Option<String>,
}

/// An ethernet device of the source VM, as needed for port provisioning.
#[derive(Debug, Clone)]
pub struct Nic {
    pub mac_address: String,
    pub label: String,
    pub summary: String,
}

/// The per-VM configuration the destination side cares about, fetched once
/// per cycle.
#[derive(Debug, Clone)]
pub struct VmFacts {
    pub moref: ManagedObjectReference,
    pub name: String,
    pub firmware: Firmware,
    pub guest_id: String,
}

/// Element match on the local name only: every vim25 response element sits
/// in the `urn:vim25` namespace, which a namespace-aware tag comparison
/// would have to spell out on every call.
pub(crate) fn is_elem(node: roxmltree::Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name
}

pub(crate) fn child_text<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    name: &str,
) -> Option<&'input str>
where
    'a: 'input,
{
    node.children().find(|n| is_elem(*n, name)).and_then(|n| n.text())
}

pub(crate) fn xsi_type<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
) -> Option<&'input str>
where
    'a: 'input,
{
    node.attribute((XSI, "type"))
}
