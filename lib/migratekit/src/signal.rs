// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal-triggered teardown.
//!
//! While a snapshot session (or a connected target) is live, SIGINT or
//! SIGTERM must run the same cleanup path as normal termination and then
//! exit non-zero. Each guard owns one listener task; dropping the guard
//! (the normal-completion path) cancels it.

use std::future::Future;

use slog::{error, warn, Logger};
use tokio::signal::unix::{signal, SignalKind};

/// Runs `cleanup` and exits with status 1 if SIGINT or SIGTERM arrives
/// before the guard is dropped.
#[must_use = "dropping the guard immediately disarms it"]
pub struct SignalGuard {
    task: tokio::task::JoinHandle<()>,
}

impl SignalGuard {
    pub fn install<F>(log: &Logger, cleanup: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let log = log.clone();
        let task = tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    error!(log, "failed to install SIGTERM handler";
                        "error" => %e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            warn!(log, "received interrupt signal, cleaning up...");
            cleanup.await;
            std::process::exit(1);
        });
        Self { task }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
