// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context};
use camino::Utf8PathBuf;
use clap::{ArgAction, Parser, Subcommand};
use slog::{debug, info, o, Drain, Level, Logger};
use uuid::Uuid;

use migratekit::migrate::{
    cutover, migration_cycle, CutoverOptions, CycleOptions, NetworkMapping,
};
use migratekit::nbdkit::Compression;
use migratekit::progress::ProgressSink;
use migratekit::session::{VddkConfig, SNAPSHOT_NAME};
use migratekit::target::{BusType, OsType, VolumeCreateOpts};
use migratekit::vsphere;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Near-live migration toolkit for VMware to OpenStack
struct Opt {
    /// VMware endpoint (hostname or IP only)
    #[clap(long)]
    vmware_endpoint: String,

    /// VMware username
    #[clap(long)]
    vmware_username: String,

    /// VMware password
    #[clap(long)]
    vmware_password: String,

    /// VMware VM path (e.g. '/Datacenter/vm/VM')
    #[clap(long)]
    vmware_path: String,

    /// Compression method used by the VDDK transport
    #[clap(long, default_value = "skipz",
        value_parser = Compression::from_str)]
    compression_method: Compression,

    /// OpenStack availability zone for block devices and the server
    #[clap(long)]
    availability_zone: Option<String>,

    /// OpenStack volume type
    #[clap(long)]
    volume_type: Option<String>,

    /// Type of disk controller the destination attaches disks to
    #[clap(long, default_value = "virtio", value_parser = BusType::from_str)]
    disk_bus_type: BusType,

    /// Look volumes up by name only (dangerous; for clouds that do not
    /// expose metadata filtering)
    #[clap(long)]
    unsafe_volume_by_name: bool,

    /// Set os_type in the volume image metadata ("auto" derives it from
    /// the VMware guest ID)
    #[clap(long)]
    os_type: Option<String>,

    /// Replicate into raw files under this directory instead of attached
    /// volumes
    #[clap(long)]
    local_base_path: Option<Utf8PathBuf>,

    /// Enable debug logging
    #[clap(long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a migration cycle without shutting off the source VM.
    ///
    /// If no data for this virtual machine exists on the target, it does a
    /// full copy; otherwise only the changed blocks are copied. A change
    /// tracking reset on the source also forces a full copy.
    Migrate,

    /// Cutover to the new virtual machine: run a migration cycle, shut
    /// down the source, run a final cycle to capture missing changes (and
    /// convert the boot disk), then spin up the replacement instance.
    Cutover {
        /// OpenStack flavor ID for the replacement server
        #[clap(long)]
        flavor: String,

        /// Network mapping, repeatable (e.g.
        /// 'mac=00:11:22:33:44:55,network-id=<uuid>,subnet-id=<uuid>[,ip=1.2.3.4]')
        #[clap(long = "network-mapping", required = true,
            value_parser = parse_network_mapping)]
        network_mapping: Vec<NetworkMapping>,

        /// OpenStack security groups for created ports, comma separated
        #[clap(long, value_delimiter = ',')]
        security_groups: Vec<String>,

        /// Run virt-v2v-in-place on the destination boot disk
        #[clap(long, default_value_t = true, action = ArgAction::Set)]
        run_v2v: bool,
    },
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

/// Renders the core's progress events as (deduplicated) log lines.
struct LogSink {
    log: Logger,
    last: Mutex<(String, u8)>,
}

impl LogSink {
    fn new(log: &Logger) -> Self {
        Self {
            log: log.clone(),
            last: Mutex::new((String::new(), u8::MAX)),
        }
    }
}

impl ProgressSink for LogSink {
    fn emit(&self, percent: u8, label: &str) {
        let step = label.split(':').next().unwrap_or(label).to_string();
        let mut last = self.last.lock().unwrap();
        if *last == (step.clone(), percent) {
            return;
        }
        debug!(self.log, "progress"; "step" => &step, "percent" => percent);
        *last = (step, percent);
    }
}

/// Parses one comma-separated `k=v` network mapping argument.
fn parse_network_mapping(value: &str) -> Result<NetworkMapping, String> {
    let mut mac = None;
    let mut network_id = None;
    let mut subnet_id = None;
    let mut ip_address = None;

    for part in value.split(',') {
        let (key, val) = part
            .split_once('=')
            .ok_or_else(|| format!("invalid network mapping: {value}"))?;
        match key {
            "mac" => {
                let parsed = macaddr::MacAddr6::from_str(val)
                    .map_err(|_| format!("invalid MAC address: {val}"))?;
                mac = Some(parsed.to_string().to_lowercase());
            }
            "network-id" => {
                network_id = Some(
                    Uuid::parse_str(val)
                        .map_err(|_| format!("invalid network ID: {val}"))?,
                );
            }
            "subnet-id" => {
                subnet_id = Some(
                    Uuid::parse_str(val)
                        .map_err(|_| format!("invalid subnet ID: {val}"))?,
                );
            }
            "ip" => {
                ip_address = Some(
                    val.parse()
                        .map_err(|_| format!("invalid IP address: {val}"))?,
                );
            }
            other => {
                return Err(format!("unknown network mapping key: {other}"))
            }
        }
    }

    Ok(NetworkMapping {
        mac_address: mac.ok_or_else(|| {
            format!("missing MAC address in network mapping: {value}")
        })?,
        network_id: network_id.ok_or_else(|| {
            format!("missing network ID in network mapping: {value}")
        })?,
        subnet_id: subnet_id.ok_or_else(|| {
            format!("missing subnet ID in network mapping: {value}")
        })?,
        ip_address,
    })
}

/// SHA-1 thumbprint of the endpoint's certificate, colon-separated the way
/// the VDDK wants it.
fn endpoint_thumbprint(endpoint: &str) -> anyhow::Result<String> {
    use openssl::hash::MessageDigest;
    use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

    let (host, port) = match endpoint.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host.to_string(), port.parse().unwrap())
        }
        _ => (endpoint.to_string(), 443),
    };

    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();

    let stream = std::net::TcpStream::connect((host.as_str(), port))
        .with_context(|| format!("failed to reach {endpoint}"))?;
    let stream = connector
        .configure()?
        .verify_hostname(false)
        .connect(&host, stream)
        .map_err(|e| anyhow!("TLS handshake with {endpoint} failed: {e}"))?;

    let cert = stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| anyhow!("no certificates found"))?;
    let digest = cert.digest(MessageDigest::sha1())?;
    Ok(digest
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(":"))
}

fn confirm(prompt: &str) -> std::io::Result<bool> {
    eprint!("{prompt} [y/N]: ");
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    let endpoint = opt.vmware_endpoint.clone();
    let thumbprint = tokio::task::spawn_blocking(move || {
        endpoint_thumbprint(&endpoint)
    })
    .await??;
    debug!(log, "endpoint thumbprint"; "thumbprint" => &thumbprint);

    let client = Arc::new(
        vsphere::Client::connect(&opt.vmware_endpoint)
            .await
            .context("failed to create VMware client")?,
    );
    client
        .login(&opt.vmware_username, &opt.vmware_password)
        .await
        .context("failed to login to VMware")?;

    let vm = client
        .find_by_inventory_path(&opt.vmware_path)
        .await?
        .ok_or_else(|| {
            anyhow!("virtual machine not found: {}", opt.vmware_path)
        })?;

    if !client.change_tracking_enabled(&vm).await? {
        bail!("change tracking is not enabled on the virtual machine");
    }

    if let Some(snapshot) = client.find_snapshot(&vm, SNAPSHOT_NAME).await? {
        info!(log, "snapshot already exists");
        if confirm("Delete existing snapshot?")? {
            let task = client.remove_snapshot(&snapshot, true).await?;
            client
                .wait_for_task(
                    &task,
                    &migratekit::progress::NullSink,
                    "Removing snapshot",
                )
                .await?;
        } else {
            bail!("unable to continue without deleting existing snapshot");
        }
    }

    let vddk = VddkConfig {
        host: opt.vmware_endpoint.clone(),
        username: opt.vmware_username.clone(),
        password: opt.vmware_password.clone(),
        thumbprint,
        compression: opt.compression_method,
        debug: opt.debug,
    };

    info!(log, "setting disk bus"; "bus" => %opt.disk_bus_type);
    let cycle_opts = CycleOptions {
        volume: VolumeCreateOpts {
            availability_zone: opt.availability_zone.clone(),
            volume_type: opt.volume_type.clone(),
            bus_type: opt.disk_bus_type,
        },
        os_type: match opt.os_type.as_deref() {
            None | Some("") => None,
            Some("auto") => Some(OsType::Auto),
            Some(name) => Some(OsType::Named(name.to_string())),
        },
        unsafe_volume_by_name: opt.unsafe_volume_by_name,
        local_base_path: opt.local_base_path.clone(),
    };

    let sink: Arc<dyn ProgressSink> = Arc::new(LogSink::new(&log));

    match &opt.cmd {
        Command::Migrate => {
            migration_cycle(
                &client,
                &vm,
                &vddk,
                &cycle_opts,
                false,
                sink,
                &log,
            )
            .await?;
            info!(log, "migration completed");
        }
        Command::Cutover {
            flavor,
            network_mapping,
            security_groups,
            run_v2v,
        } => {
            if opt.availability_zone.is_none() {
                bail!("--availability-zone is required for cutover");
            }
            let cutover_opts = CutoverOptions {
                flavor_id: flavor.clone(),
                network_mappings: network_mapping.clone(),
                security_groups: security_groups.clone(),
                availability_zone: opt.availability_zone.clone(),
                run_v2v: *run_v2v,
            };
            cutover(
                &client,
                &vm,
                &vddk,
                &cycle_opts,
                &cutover_opts,
                sink,
                &log,
            )
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_full_network_mapping() {
        let mapping = parse_network_mapping(
            "mac=00:11:22:33:44:55,\
             network-id=6bafb3d3-9d4d-4df1-86bb-bb7403403d24,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff,\
             ip=10.0.0.4",
        )
        .unwrap();
        assert_eq!(mapping.mac_address, "00:11:22:33:44:55");
        assert_eq!(
            mapping.network_id,
            Uuid::parse_str("6bafb3d3-9d4d-4df1-86bb-bb7403403d24").unwrap()
        );
        assert_eq!(
            mapping.ip_address,
            Some("10.0.0.4".parse().unwrap())
        );
    }

    #[test]
    fn ip_is_optional_but_the_rest_is_not() {
        let mapping = parse_network_mapping(
            "mac=00:11:22:33:44:55,\
             network-id=6bafb3d3-9d4d-4df1-86bb-bb7403403d24,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff",
        )
        .unwrap();
        assert_eq!(mapping.ip_address, None);

        for missing in [
            "network-id=6bafb3d3-9d4d-4df1-86bb-bb7403403d24,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff",
            "mac=00:11:22:33:44:55,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff",
            "mac=00:11:22:33:44:55,\
             network-id=6bafb3d3-9d4d-4df1-86bb-bb7403403d24",
        ] {
            assert!(parse_network_mapping(missing).is_err());
        }
    }

    #[test]
    fn rejects_malformed_mappings() {
        assert!(parse_network_mapping("mac").is_err());
        assert!(parse_network_mapping("mac=xx:yy").is_err());
        assert!(parse_network_mapping(
            "mac=00:11:22:33:44:55,network-id=not-a-uuid,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff"
        )
        .is_err());
        assert!(parse_network_mapping(
            "mac=00:11:22:33:44:55,bogus=1,\
             network-id=6bafb3d3-9d4d-4df1-86bb-bb7403403d24,\
             subnet-id=47ed1da7-82d4-4e67-9bdd-5cb4993e06ff"
        )
        .is_err());
    }

    #[test]
    fn compression_flag_accepts_known_methods() {
        assert_eq!(Compression::from_str("skipz").unwrap(), Compression::Skipz);
        assert!(Compression::from_str("brotli").is_err());
    }
}
