// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `atlasbridge pause` / `resume` — autopilot control from any process.
//!
//! The daemon's router checks a sentinel file before every policy
//! execution, so these commands work across process boundaries and
//! survive daemon restarts.

use std::path::{Path, PathBuf};

use clap::Args;

use crate::audit::{Audit, AuditEvent};
use crate::prompt::now_us;

#[derive(Debug, Args)]
pub struct CtlArgs {
    /// State directory (defaults to the standard location).
    #[arg(long, env = "ATLASBRIDGE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Machine-readable output.
    #[arg(long)]
    pub json: bool,
}

impl CtlArgs {
    fn state_dir(&self) -> PathBuf {
        match self.state_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
                    let home = std::env::var("HOME").unwrap_or_default();
                    format!("{home}/.local/state")
                });
                PathBuf::from(state_home).join("atlasbridge")
            }
        }
    }
}

/// Path of the pause sentinel under a state directory.
pub fn pause_file(state_dir: &Path) -> PathBuf {
    state_dir.join("autopilot.paused")
}

pub fn is_paused(state_dir: &Path) -> bool {
    pause_file(state_dir).exists()
}

/// Create the sentinel; every subsequent policy execution escalates.
pub fn pause(args: &CtlArgs) -> anyhow::Result<()> {
    let state_dir = args.state_dir();
    std::fs::create_dir_all(&state_dir)?;
    let already = is_paused(&state_dir);
    if !already {
        std::fs::write(pause_file(&state_dir), format!("{}\n", now_us()))?;
        record(&state_dir, AuditEvent::AutopilotPaused);
    }
    report(args.json, "paused", already);
    Ok(())
}

/// Remove the sentinel; the loaded policy takes effect again.
pub fn resume(args: &CtlArgs) -> anyhow::Result<()> {
    let state_dir = args.state_dir();
    let was_paused = is_paused(&state_dir);
    if was_paused {
        std::fs::remove_file(pause_file(&state_dir))?;
        record(&state_dir, AuditEvent::AutopilotResumed);
    }
    report(args.json, "resumed", !was_paused);
    Ok(())
}

fn record(state_dir: &Path, event: AuditEvent) {
    match Audit::open(&state_dir.join("audit.log"), None) {
        Ok(audit) => {
            audit.record(event);
        }
        Err(e) => tracing::warn!("audit unavailable for control event: {e:#}"),
    }
}

fn report(json: bool, state: &str, no_op: bool) {
    if json {
        println!("{}", serde_json::json!({ "autopilot": state, "changed": !no_op }));
    } else if no_op {
        println!("autopilot already {state}");
    } else {
        println!("autopilot {state}");
    }
}

#[cfg(test)]
#[path = "control_tests.rs"]
mod tests;
