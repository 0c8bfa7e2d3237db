// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host terminal raw mode for the lifetime of a session.

use std::os::fd::{AsRawFd, BorrowedFd};

use nix::sys::termios;

/// RAII guard that restores the original terminal attributes on drop.
///
/// Stores a raw fd (stdin) and the original termios state. The fd is valid
/// for the process lifetime.
pub struct RawModeGuard {
    fd: std::os::fd::RawFd,
    original: nix::libc::termios,
}

impl RawModeGuard {
    /// Put the host terminal into raw mode. Fails when stdin is not a tty.
    pub fn enter() -> anyhow::Result<Self> {
        let fd = std::io::stdin().as_raw_fd();
        let borrowed = borrow_fd(fd);
        let original = termios::tcgetattr(borrowed)?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &raw)?;
        Ok(Self { fd, original: original.into() })
    }

    /// Restore the saved attributes without waiting for drop. Safe to call
    /// more than once.
    pub fn restore(&self) {
        let borrowed = borrow_fd(self.fd);
        let original: termios::Termios = self.original.into();
        let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &original);
    }

    /// Install a panic hook that restores the terminal even on unwind.
    pub fn install_panic_hook(&self) {
        let fd = self.fd;
        let original = self.original;
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let borrowed = borrow_fd(fd);
            let original: termios::Termios = original.into();
            let _ = termios::tcsetattr(borrowed, termios::SetArg::TCSAFLUSH, &original);
            previous(info);
        }));
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Create a `BorrowedFd` from a raw fd that we know is valid.
#[allow(unsafe_code)]
fn borrow_fd(fd: std::os::fd::RawFd) -> BorrowedFd<'static> {
    // SAFETY: stdin stays open for the process lifetime.
    unsafe { BorrowedFd::borrow_raw(fd) }
}
