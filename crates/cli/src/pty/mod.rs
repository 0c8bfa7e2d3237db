// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pseudoterminal backend: spawn a child on a PTY, pump bytes both ways,
//! resize, signal, and reap. POSIX only — the `--experimental` flag exists
//! for future ConPTY work, but non-unix targets fail fast at startup.

pub mod fd;
pub mod rawmode;
pub mod spawn;

pub use rawmode::RawModeGuard;
pub use spawn::NativePty;

use serde::{Deserialize, Serialize};

/// Exit status of the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Effective process exit code: the child's own code, or 128+signal.
    pub fn effective_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

/// Current size of the host terminal, if stdout is a tty.
pub fn host_winsize() -> Option<(u16, u16)> {
    let winsize = rustix::termios::tcgetwinsize(std::io::stdout()).ok()?;
    if winsize.ws_col == 0 || winsize.ws_row == 0 {
        return None;
    }
    Some((winsize.ws_col, winsize.ws_row))
}
