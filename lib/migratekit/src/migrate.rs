// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-VM migration cycle and the two-phase cutover.
//!
//! A cycle opens one snapshot session, replicates every disk serially
//! (full or delta, chosen per disk), and persists the snapshot's change ID
//! on the target only after that disk's copy succeeded. A failed copy
//! leaves the previous checkpoint in place, so the next cycle re-decides
//! from accurate state.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{error, info, o, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

use crate::change_id::{ChangeId, ChangeIdError};
use crate::copy::{self, CopyError};
use crate::openstack::{
    BlockDeviceMapping, ClientSet, OpenstackError,
};
use crate::progress::ProgressSink;
use crate::session::{
    DiskExport, SessionError, SnapshotSession, VddkConfig,
};
use crate::signal::SignalGuard;
use crate::target::{
    volume_for_disk, LocalDisk, OpenStackTarget, OsType, Target,
    TargetError, VolumeCreateOpts,
};
use crate::vsphere::{
    Client, ManagedObjectReference, PowerState, VmFacts, VsphereError,
};

/// How long a replacement server may take to reach `ACTIVE`.
const SERVER_ACTIVE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("vSphere request failed")]
    Vsphere(#[from] VsphereError),

    #[error("snapshot session failed")]
    Session(#[from] SessionError),

    #[error("target operation failed")]
    Target(#[from] TargetError),

    #[error("copy failed")]
    Copy(#[from] CopyError),

    #[error("OpenStack request failed")]
    Openstack(#[from] OpenstackError),

    #[error("change ID error")]
    ChangeId(#[from] ChangeIdError),

    #[error("virt-v2v-in-place exited with {0}")]
    ConversionFailed(std::process::ExitStatus),

    #[error("no network mapping found for MAC address {mac}")]
    NoNetworkMapping { mac: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Everything one cycle needs beyond the session itself. Threaded
/// explicitly; nothing rides in ambient state.
#[derive(Clone, Debug, Default)]
pub struct CycleOptions {
    pub volume: VolumeCreateOpts,
    pub os_type: Option<OsType>,
    pub unsafe_volume_by_name: bool,
    /// Replicate into raw files under this directory instead of attached
    /// volumes.
    pub local_base_path: Option<Utf8PathBuf>,
}

/// Cutover-only inputs.
#[derive(Clone, Debug)]
pub struct CutoverOptions {
    pub flavor_id: String,
    pub network_mappings: Vec<NetworkMapping>,
    pub security_groups: Vec<String>,
    pub availability_zone: Option<String>,
    pub run_v2v: bool,
}

/// Destination network placement for one source NIC, keyed by MAC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkMapping {
    pub mac_address: String,
    pub network_id: Uuid,
    pub subnet_id: Uuid,
    pub ip_address: Option<std::net::IpAddr>,
}

/// What kind of pass a disk needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Full {
        /// The destination was just created, so it is known zero-filled.
        target_is_clean: bool,
    },
    Delta,
}

/// Runs one migration cycle: snapshot, per-disk replication, teardown.
/// `run_v2v` converts the first disk's image in place after its copy (the
/// cutover's final cycle only).
pub async fn migration_cycle(
    client: &Arc<Client>,
    vm: &ManagedObjectReference,
    vddk: &VddkConfig,
    opts: &CycleOptions,
    run_v2v: bool,
    sink: Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), MigrateError> {
    let facts = client.vm_facts(vm).await?;
    let clients = match opts.local_base_path {
        None => Some(Arc::new(ClientSet::from_env(log).await?)),
        Some(_) => None,
    };

    let session = SnapshotSession::start(
        Arc::clone(client),
        vm,
        vddk,
        Arc::clone(&sink),
        log,
    )
    .await?;

    let result = run_disks(
        client,
        &session,
        &facts,
        clients.as_ref(),
        opts,
        run_v2v,
        vddk.debug,
        &sink,
        log,
    )
    .await;

    // The snapshot always comes down, error path included.
    match session.stop().await {
        Ok(()) => result,
        Err(stop_err) => match result {
            Ok(()) => Err(stop_err.into()),
            Err(e) => {
                error!(log, "failed to stop snapshot session after error";
                    "error" => %stop_err);
                Err(e)
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_disks(
    client: &Arc<Client>,
    session: &SnapshotSession,
    facts: &VmFacts,
    clients: Option<&Arc<ClientSet>>,
    opts: &CycleOptions,
    run_v2v: bool,
    debug: bool,
    sink: &Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), MigrateError> {
    for (index, export) in session.exports().await.into_iter().enumerate() {
        let target = match &opts.local_base_path {
            Some(base) => Target::Local(LocalDisk::new(
                base,
                &facts.name,
                export.disk.clone(),
                log,
            )),
            None => Target::OpenStack(OpenStackTarget::new(
                Arc::clone(clients.expect("volume targets have a client")),
                facts.clone(),
                export.disk.clone(),
                opts.volume.clone(),
                opts.os_type.clone(),
                opts.unsafe_volume_by_name,
                log,
            )),
        };

        // Conversion only ever applies to the boot disk.
        let convert = run_v2v && index == 0;
        sync_to_target(
            client,
            session,
            &export,
            Arc::new(target),
            convert,
            debug,
            sink,
            log,
        )
        .await?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn sync_to_target(
    client: &Arc<Client>,
    session: &SnapshotSession,
    export: &DiskExport,
    target: Arc<Target>,
    run_v2v: bool,
    debug: bool,
    sink: &Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), MigrateError> {
    let log = log.new(o!(
        "disk" => export.disk.key,
        "file" => export.disk.backing.file_name()
            .unwrap_or_default().to_string(),
    ));

    let snapshot_id = ChangeId::from_disk(&export.disk)?;
    let (pass, persisted) = plan_pass(&target, &snapshot_id, &log).await?;

    target.connect().await?;

    let guard_target = Arc::clone(&target);
    let guard_log = log.clone();
    let _signal_guard = SignalGuard::install(&log, async move {
        if let Err(e) = guard_target.disconnect().await {
            error!(guard_log, "failed to disconnect target";
                "error" => %e);
        }
    });

    let result = replicate_disk(
        client,
        session,
        export,
        &target,
        pass,
        &persisted,
        &snapshot_id,
        run_v2v,
        debug,
        sink,
        &log,
    )
    .await;

    let disconnect = target.disconnect().await;
    match result {
        Ok(()) => Ok(disconnect?),
        Err(e) => {
            if let Err(d) = disconnect {
                warn!(log, "failed to disconnect target after error";
                    "error" => %d);
            }
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn replicate_disk(
    client: &Arc<Client>,
    session: &SnapshotSession,
    export: &DiskExport,
    target: &Target,
    pass: Pass,
    persisted: &ChangeId,
    snapshot_id: &ChangeId,
    run_v2v: bool,
    debug: bool,
    sink: &Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), MigrateError> {
    let path = target.path().await?;

    match pass {
        Pass::Full { target_is_clean } => {
            info!(log, "starting full copy");
            copy::full::run(
                &export.export_uri,
                &path,
                export.disk.capacity_in_bytes,
                target_is_clean,
                Arc::clone(sink),
                log,
            )
            .await?;
            info!(log, "full copy completed");
        }
        Pass::Delta => {
            info!(log, "starting incremental copy");
            copy::delta::run(
                client,
                session.vm(),
                session.snapshot(),
                &export.disk,
                persisted,
                &export.export_uri,
                &path,
                Arc::clone(sink),
                log,
            )
            .await?;
            info!(log, "incremental copy completed");
        }
    }

    if run_v2v {
        info!(log, "running virt-v2v-in-place");
        convert_guest_image(debug, &path).await?;
        // Conversion rewrote the image under us; only a fresh full copy
        // can bring the checkpoint lineage back in sync.
        target.write_change_id(&ChangeId::empty()).await?;
    } else {
        target.write_change_id(snapshot_id).await?;
    }
    Ok(())
}

/// Decides which pass `target` needs relative to the snapshot's change ID
/// and returns the persisted checkpoint a delta would start from.
async fn plan_pass(
    target: &Target,
    snapshot_id: &ChangeId,
    log: &Logger,
) -> Result<(Pass, ChangeId), MigrateError> {
    if !target.exists().await? {
        info!(log, "data does not exist, full copy needed");
        return Ok((Pass::Full { target_is_clean: true }, ChangeId::empty()));
    }

    let persisted = match target.current_change_id().await {
        Ok(id) => Some(id),
        // An unreadable checkpoint downgrades to a full copy; any other
        // failure reading the target is real.
        Err(TargetError::ChangeId(ChangeIdError::InvalidChangeId)) => None,
        Err(e) => return Err(e.into()),
    };

    let pass = decide_pass(true, persisted.as_ref(), snapshot_id);
    match pass {
        Pass::Full { .. } => match &persisted {
            None => info!(log,
                "no or invalid change ID found, assuming full copy is needed"),
            Some(p) if p.is_empty() => info!(log,
                "no or invalid change ID found, assuming full copy is needed"),
            Some(p) => warn!(log, "change ID mismatch, full copy needed";
                "current" => &p.value, "snapshot" => &snapshot_id.value),
        },
        Pass::Delta => info!(log, "incremental copy possible"),
    }

    Ok((pass, persisted.unwrap_or_else(ChangeId::empty)))
}

/// The pass-selection predicate over observed target state. `persisted` is
/// `None` when the stored checkpoint could not be parsed.
fn decide_pass(
    exists: bool,
    persisted: Option<&ChangeId>,
    snapshot: &ChangeId,
) -> Pass {
    if !exists {
        return Pass::Full { target_is_clean: true };
    }
    match persisted {
        None => Pass::Full { target_is_clean: false },
        Some(p) if p.is_empty() => Pass::Full { target_is_clean: false },
        Some(p) if p.uuid != snapshot.uuid => {
            // CBT was reset on the source; the delta base is gone.
            Pass::Full { target_is_clean: false }
        }
        Some(_) => Pass::Delta,
    }
}

/// Rewrites the copied image in place for the destination hypervisor.
async fn convert_guest_image(
    debug: bool,
    path: &Utf8Path,
) -> Result<(), MigrateError> {
    let mut cmd = tokio::process::Command::new("virt-v2v-in-place");
    if debug {
        cmd.arg("-v").arg("-x");
    }
    cmd.arg("--no-selinux-relabel").arg("-i").arg("disk").arg(path.as_str());
    cmd.env("LIBGUESTFS_BACKEND", "direct");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = cmd.status().await?;
    if !status.success() {
        return Err(MigrateError::ConversionFailed(status));
    }
    Ok(())
}

/// The cutover sequence: provision network resources, replicate, power off
/// the source, replicate the residue (converting the boot disk), then
/// create the replacement server from the migrated volumes.
pub async fn cutover(
    client: &Arc<Client>,
    vm: &ManagedObjectReference,
    vddk: &VddkConfig,
    opts: &CycleOptions,
    cutover_opts: &CutoverOptions,
    sink: Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), MigrateError> {
    let clients = Arc::new(ClientSet::from_env(log).await?);

    info!(log, "ensuring OpenStack resources exist");
    let flavor = clients.get_flavor(&cutover_opts.flavor_id).await?;
    info!(log, "flavor exists, ensuring network resources exist";
        "flavor" => &flavor.name);
    let ports = ensure_ports(
        &clients,
        client,
        vm,
        &cutover_opts.network_mappings,
        &cutover_opts.security_groups,
        log,
    )
    .await?;

    info!(log, "starting migration cycle");
    migration_cycle(client, vm, vddk, opts, false, Arc::clone(&sink), log)
        .await?;

    info!(log, "completed migration cycle, shutting down source VM");
    match client.power_state(vm).await? {
        PowerState::PoweredOff => {
            warn!(log, "source VM is already off, skipping shutdown");
        }
        _ => {
            client.shutdown_guest(vm).await?;
            client.wait_for_power_state(vm, PowerState::PoweredOff).await?;
            info!(log, "source VM shut down, starting final migration cycle");
        }
    }

    migration_cycle(
        client,
        vm,
        vddk,
        opts,
        cutover_opts.run_v2v,
        Arc::clone(&sink),
        log,
    )
    .await?;

    info!(log, "final migration cycle completed, spinning up new OpenStack VM");
    create_replacement_server(&clients, client, vm, opts, cutover_opts, ports, log)
        .await?;

    info!(log, "cutover completed");
    Ok(())
}

/// Ensures one neutron port per source NIC, honoring the operator's
/// MAC-keyed network mappings. Existing ports are reused.
async fn ensure_ports(
    clients: &ClientSet,
    vsphere: &Client,
    vm: &ManagedObjectReference,
    mappings: &[NetworkMapping],
    security_groups: &[String],
    log: &Logger,
) -> Result<Vec<Uuid>, MigrateError> {
    let nics = vsphere.vm_nics(vm).await?;
    let mut ports = Vec::new();

    for nic in nics {
        let mapping = mappings
            .iter()
            .find(|m| m.mac_address.eq_ignore_ascii_case(&nic.mac_address))
            .ok_or_else(|| MigrateError::NoNetworkMapping {
                mac: nic.mac_address.clone(),
            })?;

        let existing =
            clients.list_ports(mapping.network_id, &nic.mac_address).await?;
        let port = match existing.len() {
            0 => {
                let security_groups = (!security_groups.is_empty())
                    .then(|| security_groups.to_vec());
                let port = clients
                    .create_port(
                        mapping.network_id,
                        &nic.label,
                        &nic.summary,
                        &nic.mac_address,
                        mapping.subnet_id,
                        mapping.ip_address.map(|ip| ip.to_string()),
                        security_groups,
                    )
                    .await?;
                info!(log, "port created"; "port" => %port.id);
                port
            }
            1 => {
                let port = existing.into_iter().next().unwrap();
                info!(log, "port already exists"; "port" => %port.id);
                port
            }
            _ => {
                return Err(OpenstackError::AmbiguousPort {
                    mac: nic.mac_address.clone(),
                }
                .into())
            }
        };
        ports.push(port.id);
    }

    Ok(ports)
}

async fn create_replacement_server(
    clients: &ClientSet,
    vsphere: &Client,
    vm: &ManagedObjectReference,
    opts: &CycleOptions,
    cutover_opts: &CutoverOptions,
    ports: Vec<Uuid>,
    log: &Logger,
) -> Result<(), MigrateError> {
    let facts = vsphere.vm_facts(vm).await?;
    let disks = vsphere.hardware_disks(vm).await?;

    let mut block_devices = Vec::new();
    for (index, disk) in disks.iter().enumerate() {
        let volume = volume_for_disk(
            clients,
            &facts,
            disk,
            opts.unsafe_volume_by_name,
            log,
        )
        .await?;
        block_devices.push(BlockDeviceMapping {
            boot_index: index as i32,
            uuid: volume.id,
            source_type: "volume".to_string(),
            destination_type: "volume".to_string(),
        });
    }

    let server = clients
        .create_server(
            &facts.name,
            &cutover_opts.flavor_id,
            ports,
            block_devices,
            cutover_opts.availability_zone.as_deref(),
        )
        .await?;
    clients
        .wait_for_server_status(server.id, "ACTIVE", SERVER_ACTIVE_TIMEOUT)
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(raw: &str) -> ChangeId {
        ChangeId::parse(raw).unwrap()
    }

    #[test]
    fn first_ever_pass_is_full_and_clean() {
        assert_eq!(
            decide_pass(false, None, &id("e1c4/42")),
            Pass::Full { target_is_clean: true }
        );
    }

    #[test]
    fn stale_id_with_same_uuid_is_a_delta() {
        let persisted = id("aaaa/7");
        assert_eq!(
            decide_pass(true, Some(&persisted), &id("aaaa/9")),
            Pass::Delta
        );
    }

    #[test]
    fn cbt_reset_forces_a_dirty_full_pass() {
        let persisted = id("aaaa/7");
        assert_eq!(
            decide_pass(true, Some(&persisted), &id("bbbb/1")),
            Pass::Full { target_is_clean: false }
        );
    }

    #[test]
    fn sentinel_checkpoint_forces_a_dirty_full_pass() {
        let persisted = ChangeId::empty();
        assert_eq!(
            decide_pass(true, Some(&persisted), &id("aaaa/9")),
            Pass::Full { target_is_clean: false }
        );
    }

    #[test]
    fn unparseable_checkpoint_forces_a_dirty_full_pass() {
        assert_eq!(
            decide_pass(true, None, &id("aaaa/9")),
            Pass::Full { target_is_clean: false }
        );
    }
}
