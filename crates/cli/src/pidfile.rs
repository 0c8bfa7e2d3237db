// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon singleton enforcement via a pid file in the state directory.
//!
//! A stale file left by a crashed process (its pid no longer alive) is
//! taken over; a live owner is a hard environment error.

use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::debug;

use crate::error::Fault;

/// Held lock on the pid file; removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Acquire the singleton lock, taking over stale files.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(owner) = read_owner(path) {
            if owner != std::process::id() && pid_alive(owner) {
                return Err(Fault::environment(format!(
                    "another atlasbridge daemon is running (pid {owner})"
                )));
            }
            debug!("taking over stale pid file from pid {owner}");
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self { path: path.to_owned() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the file if we still own it.
        if read_owner(&self.path) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Signal-0 probe: does the pid still exist?
fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
#[path = "pidfile_tests.rs"]
mod tests;
