// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Near-live replication of VMware virtual machine disks onto OpenStack
//! block storage.
//!
//! The crate is organized around one migration cycle per virtual machine:
//! an ephemeral vSphere snapshot is taken ([`session`]), each snapshot disk
//! is exported over NBD by a supervised `nbdkit` child ([`nbdkit`]), and the
//! orchestrator ([`migrate`]) streams either the whole disk ([`copy::full`])
//! or only the regions VMware Changed Block Tracking reports as dirty
//! ([`copy::delta`]) onto the destination ([`target`]). The CBT checkpoint
//! that a pass was taken from is persisted on the destination afterwards,
//! never before.

pub mod change_id;
pub mod copy;
pub mod migrate;
pub mod nbd;
pub mod nbdkit;
pub mod openstack;
pub mod progress;
pub mod session;
pub mod signal;
pub mod target;
pub mod vsphere;
