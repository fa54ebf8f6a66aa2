// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervision of the `nbdkit` child that exports one snapshot disk over a
//! Unix socket using the VDDK plugin.
//!
//! `nbdkit` has no readiness signal other than writing its pid file, so
//! startup waits for that file to appear. Any file creation within the
//! wait window counts as ready.

use std::process::Stdio;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use slog::{debug, info, Logger};
use tokio::process::{Child, Command};

use thiserror::Error;

/// How long to wait for the pid file before declaring the child wedged.
const PIDFILE_TIMEOUT: Duration = Duration::from_secs(10);
const PIDFILE_POLL: Duration = Duration::from_millis(100);

/// Where the VDDK native libraries live on the migrator host.
const VDDK_LIBRARY_PATH: &str = "/usr/lib64/vmware-vix-disklib/lib64";

#[derive(Debug, Error)]
pub enum NbdkitError {
    #[error("failed to launch nbdkit")]
    SpawnFailed(#[source] std::io::Error),

    #[error(
        "timed out waiting for pid file {pidfile} to appear\n{output}"
    )]
    PidFileTimeout { pidfile: Utf8PathBuf, output: String },

    #[error("nbdkit exited during startup ({status})\n{output}")]
    ChildExited { status: std::process::ExitStatus, output: String },

    #[error("I/O error supervising nbdkit")]
    Io(#[from] std::io::Error),
}

/// Compression applied by the VDDK transport on the wire from ESXi.
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
pub enum Compression {
    None,
    Zlib,
    Fastlz,
    #[default]
    Skipz,
}

/// Everything needed to point one `nbdkit` instance at one snapshot disk.
#[derive(Clone, Debug, Default)]
pub struct NbdkitBuilder {
    server: String,
    username: String,
    password: String,
    thumbprint: String,
    vm_moref: String,
    snapshot_moref: String,
    filename: String,
    compression: Compression,
}

impl NbdkitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = server.to_string();
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn thumbprint(mut self, thumbprint: &str) -> Self {
        self.thumbprint = thumbprint.to_string();
        self
    }

    pub fn virtual_machine(mut self, moref: &str) -> Self {
        self.vm_moref = moref.to_string();
        self
    }

    pub fn snapshot(mut self, moref: &str) -> Self {
        self.snapshot_moref = moref.to_string();
        self
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = filename.to_string();
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn args(&self, socket: &Utf8Path, pidfile: &Utf8Path) -> Vec<String> {
        vec![
            "--exit-with-parent".to_string(),
            "--readonly".to_string(),
            "--foreground".to_string(),
            format!("--unix={}", socket),
            format!("--pidfile={}", pidfile),
            "vddk".to_string(),
            format!("server={}", self.server),
            format!("user={}", self.username),
            format!("password={}", self.password),
            format!("thumbprint={}", self.thumbprint),
            format!("compression={}", self.compression),
            format!("vm=moref={}", self.vm_moref),
            format!("snapshot={}", self.snapshot_moref),
            "transports=file:nbdssl:nbd".to_string(),
            self.filename.clone(),
        ]
    }

    /// Launches the child and waits for it to come up.
    pub async fn spawn(
        self,
        log: &Logger,
    ) -> Result<NbdkitServer, NbdkitError> {
        let scratch = tempfile::Builder::new()
            .prefix("migratekit-")
            .tempdir()
            .map_err(NbdkitError::Io)?;
        let scratch_path = Utf8Path::from_path(scratch.path())
            .expect("tempdir paths are UTF-8")
            .to_path_buf();
        let socket = scratch_path.join("nbdkit.sock");
        let pidfile = scratch_path.join("nbdkit.pid");

        debug!(log, "launching nbdkit";
            "disk" => &self.filename, "socket" => socket.as_str());

        let child = Command::new("nbdkit")
            .args(self.args(&socket, &pidfile))
            .env("LD_LIBRARY_PATH", VDDK_LIBRARY_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NbdkitError::SpawnFailed)?;

        let mut server =
            NbdkitServer { child, _scratch: scratch, socket, pidfile };
        server.wait_for_pidfile(log).await?;
        Ok(server)
    }
}

/// A running export. Valid between a successful spawn and `stop`; the
/// child is killed with the handle if the caller never stops it.
pub struct NbdkitServer {
    child: Child,
    _scratch: tempfile::TempDir,
    socket: Utf8PathBuf,
    pidfile: Utf8PathBuf,
}

impl NbdkitServer {
    /// The socket the child serves NBD on.
    pub fn socket(&self) -> &Utf8Path {
        &self.socket
    }

    /// The URI handed to the copy drivers.
    pub fn export_uri(&self) -> String {
        export_uri_for(&self.socket)
    }

    async fn wait_for_pidfile(
        &mut self,
        log: &Logger,
    ) -> Result<(), NbdkitError> {
        let deadline = tokio::time::Instant::now() + PIDFILE_TIMEOUT;
        loop {
            if self.pidfile.exists() {
                info!(log, "nbdkit ready"; "socket" => self.socket.as_str());
                return Ok(());
            }
            if let Some(status) = self.child.try_wait()? {
                let output = self.drain_output().await;
                return Err(NbdkitError::ChildExited { status, output });
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = self.child.start_kill();
                let _ = self.child.wait().await;
                let output = self.drain_output().await;
                return Err(NbdkitError::PidFileTimeout {
                    pidfile: self.pidfile.clone(),
                    output,
                });
            }
            tokio::time::sleep(PIDFILE_POLL).await;
        }
    }

    async fn drain_output(&mut self) -> String {
        use tokio::io::AsyncReadExt;

        let mut out = String::new();
        if let Some(mut stdout) = self.child.stdout.take() {
            let mut buf = String::new();
            if stdout.read_to_string(&mut buf).await.is_ok() {
                out.push_str("stdout: ");
                out.push_str(&buf);
            }
        }
        if let Some(mut stderr) = self.child.stderr.take() {
            let mut buf = String::new();
            if stderr.read_to_string(&mut buf).await.is_ok() {
                out.push_str("\nstderr: ");
                out.push_str(&buf);
            }
        }
        out
    }

    /// Kills the child and removes the socket. Scratch-directory removal is
    /// best-effort and nothing depends on it.
    pub async fn stop(mut self, log: &Logger) -> Result<(), NbdkitError> {
        debug!(log, "stopping nbdkit"; "socket" => self.socket.as_str());
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        let _ = std::fs::remove_file(&self.socket);
        Ok(())
    }
}

fn export_uri_for(socket: &Utf8Path) -> String {
    format!("nbd+unix:///?socket={}", socket)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builds_the_vddk_command_line() {
        let builder = NbdkitBuilder::new()
            .server("vcenter.example.com")
            .username("administrator@vsphere.local")
            .password("hunter2")
            .thumbprint("AA:BB:CC")
            .virtual_machine("vm-20")
            .snapshot("snapshot-77")
            .filename("[ds1] guest/guest.vmdk")
            .compression(Compression::Zlib);
        let args = builder.args(
            Utf8Path::new("/tmp/migratekit-x/nbdkit.sock"),
            Utf8Path::new("/tmp/migratekit-x/nbdkit.pid"),
        );
        assert_eq!(args[0], "--exit-with-parent");
        assert!(args.contains(&"--readonly".to_string()));
        assert!(args
            .contains(&"--unix=/tmp/migratekit-x/nbdkit.sock".to_string()));
        assert!(args
            .contains(&"--pidfile=/tmp/migratekit-x/nbdkit.pid".to_string()));
        assert!(args.contains(&"vddk".to_string()));
        assert!(args.contains(&"compression=zlib".to_string()));
        assert!(args.contains(&"vm=moref=vm-20".to_string()));
        assert!(args.contains(&"snapshot=snapshot-77".to_string()));
        assert_eq!(args.last().unwrap(), "[ds1] guest/guest.vmdk");
    }

    #[test]
    fn export_uri_points_at_the_socket() {
        assert_eq!(
            export_uri_for(Utf8Path::new("/tmp/migratekit-x/nbdkit.sock")),
            "nbd+unix:///?socket=/tmp/migratekit-x/nbdkit.sock"
        );
    }

    #[test]
    fn compression_selector_round_trips() {
        use std::str::FromStr;

        for (s, c) in [
            ("none", Compression::None),
            ("zlib", Compression::Zlib),
            ("fastlz", Compression::Fastlz),
            ("skipz", Compression::Skipz),
        ] {
            assert_eq!(Compression::from_str(s).unwrap(), c);
            assert_eq!(c.to_string(), s);
        }
        assert_eq!(Compression::default(), Compression::Skipz);
    }
}
