// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spawn the supervised child on a fresh pseudoterminal via `forkpty`.

use std::ffi::CString;
use std::os::fd::AsRawFd;

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use super::fd::{read_chunk, set_nonblocking, write_all, MasterFd};
use super::ExitStatus;
use crate::error::Fault;

/// A child process attached to a PTY master.
pub struct NativePty {
    master: AsyncFd<MasterFd>,
    child_pid: Pid,
    reaped: bool,
}

impl NativePty {
    /// Spawn `argv` on a new PTY with the given window size and extra
    /// environment. `argv` must be non-empty.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        argv: &[String],
        env: &[(String, String)],
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        if argv.is_empty() {
            return Err(Fault::environment("no command to run"));
        }
        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }
            .map_err(|e| Fault::environment(format!("forkpty failed: {e}")))?;

        match result {
            ForkptyResult::Child => {
                // Child process: set env and exec.
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("ATLASBRIDGE", "1");
                for (key, value) in env {
                    std::env::set_var(key, value);
                }

                let c_args: Vec<CString> = argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let afd = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master: afd, child_pid: child, reaped: false })
            }
        }
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// Pump loop: child output → `output_tx`, `input_rx` → child stdin.
    ///
    /// Returns the child's exit status once the master hits EOF (or EIO,
    /// which Linux raises when the slave side closes). Consumes the PTY;
    /// the caller keeps resize/signal access through the pid and the
    /// handles returned by [`Self::controls`].
    pub async fn run(
        mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];
        let mut input_open = true;

        loop {
            tokio::select! {
                result = read_chunk(&self.master, &mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if output_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                input = input_rx.recv(), if input_open => {
                    match input {
                        Some(data) => write_all(&self.master, &data).await?,
                        None => input_open = false,
                    }
                }
            }
        }

        // Reap on a blocking thread to avoid stalling the runtime.
        let status = tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")??;
        self.reaped = true;
        Ok(status)
    }

    /// Detach the resize/signal controls for use outside the pump task.
    pub fn controls(&self) -> PtyControls {
        PtyControls { master_fd: self.master.as_raw_fd(), child_pid: self.child_pid }
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Best-effort graceful shutdown: SIGHUP then SIGKILL.
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Resize and signal access to a running PTY, independent of the pump.
#[derive(Debug, Clone, Copy)]
pub struct PtyControls {
    master_fd: std::os::fd::RawFd,
    child_pid: Pid,
}

impl PtyControls {
    /// Propagate a window-size change to the child.
    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd. The Winsize struct is properly
        // initialized.
        let ret = unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Send a signal to the child.
    pub fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        kill(self.child_pid, signal).context("kill failed")?;
        Ok(())
    }

    /// SIGHUP the child's process group (shutdown path).
    pub fn hangup_group(&self) {
        let _ = kill(Pid::from_raw(-(self.child_pid.as_raw())), Signal::SIGHUP);
    }

    /// Whether the child still exists (signal 0 probe).
    pub fn alive(&self) -> bool {
        kill(self.child_pid, None).is_ok()
    }

    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

/// Block until the child exits and convert to our `ExitStatus`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
