// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The two ways disk bytes reach the destination: a full streaming pass
//! and a CBT-driven delta pass.

pub mod delta;
pub mod full;

use thiserror::Error;

use crate::nbd::NbdError;
use crate::vsphere::VsphereError;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to launch nbdcopy")]
    SpawnFailed(#[source] std::io::Error),

    #[error("nbdcopy exited with {0}")]
    CopierFailed(std::process::ExitStatus),

    #[error("NBD transport error")]
    Nbd(#[from] NbdError),

    #[error("changed-block query failed")]
    Vsphere(#[from] VsphereError),

    #[error("destination I/O error")]
    Io(#[from] std::io::Error),
}
