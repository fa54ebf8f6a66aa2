// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full-disk streaming through an external `nbdcopy` child.
//!
//! The child reports progress as newline-delimited `"<percent>/100"` lines
//! on file descriptor 3; a pipe write end is dup'd onto that descriptor at
//! exec time and the parent's copy is closed right after spawn so the
//! reader sees EOF exactly when the child exits.

use std::io::{BufRead, BufReader};
use std::os::fd::FromRawFd;
use std::process::Stdio;
use std::sync::Arc;

use camino::Utf8Path;
use slog::{info, warn, Logger};
use tokio::process::Command;

use super::CopyError;
use crate::progress::{emit_bytes, ProgressSink};

/// Copies `size` bytes from the NBD export at `source` onto `destination`.
///
/// `target_is_clean` tells the copier the destination is known to be
/// zero-filled, which lets it skip writing zero blocks.
pub async fn run(
    source: &str,
    destination: &Utf8Path,
    size: i64,
    target_is_clean: bool,
    progress: Arc<dyn ProgressSink>,
    log: &Logger,
) -> Result<(), CopyError> {
    let (pipe_read, pipe_write) = pipe()?;

    let mut cmd = Command::new("nbdcopy");
    cmd.arg("--progress=3").arg(source).arg(destination.as_str());
    if target_is_clean {
        cmd.arg("--destination-is-zero");
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
    // Make the pipe's write end appear as fd 3 in the child. dup2 clears
    // close-on-exec on the duplicate.
    unsafe {
        cmd.pre_exec(move || {
            if libc::dup2(pipe_write, 3) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    info!(log, "running nbdcopy";
        "source" => source, "destination" => destination.as_str());
    let spawned = cmd.spawn();
    // The child holds its own copies now; keeping ours open would delay
    // EOF on the reader until this process exits.
    unsafe { libc::close(pipe_write) };
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            unsafe { libc::close(pipe_read) };
            return Err(CopyError::SpawnFailed(e));
        }
    };

    let reader_log = log.clone();
    let total = size as u64;
    let reader = tokio::task::spawn_blocking(move || {
        let file = unsafe { std::fs::File::from_raw_fd(pipe_read) };
        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(reader_log, "error reading progress pipe";
                        "error" => %e);
                    break;
                }
            };
            match parse_progress_line(&line) {
                Some(percent) => emit_bytes(
                    progress.as_ref(),
                    "Full copy",
                    percent * total / 100,
                    total,
                ),
                None => warn!(reader_log, "unparseable progress line";
                    "line" => line),
            }
        }
    });

    let status = child.wait().await?;
    let _ = reader.await;
    if !status.success() {
        return Err(CopyError::CopierFailed(status));
    }
    Ok(())
}

fn pipe() -> Result<(libc::c_int, libc::c_int), CopyError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(CopyError::Io(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

/// Parses one `"<percent>/<total>"` progress line to the left-hand token.
fn parse_progress_line(line: &str) -> Option<u64> {
    let (percent, _) = line.split_once('/')?;
    percent.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::parse_progress_line;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(parse_progress_line("0/100"), Some(0));
        assert_eq!(parse_progress_line("37/100"), Some(37));
        assert_eq!(parse_progress_line("100/100"), Some(100));
        assert_eq!(parse_progress_line(""), None);
        assert_eq!(parse_progress_line("37"), None);
        assert_eq!(parse_progress_line("x/100"), None);
    }
}
