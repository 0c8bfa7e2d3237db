// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Non-blocking I/O over the PTY master fd.

use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use tokio::io::unix::AsyncFd;

/// Newtype wrapper around the master `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
pub struct MasterFd(pub OwnedFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// Set the given file descriptor to non-blocking mode.
pub fn set_nonblocking(fd: &impl AsFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

/// Read one chunk from the master, waiting at most `deadline`.
///
/// Returns `Ok(None)` when the deadline lapses with nothing readable,
/// `Ok(Some(0))` on EOF, and `Ok(Some(n))` for data.
pub async fn read_deadline(
    afd: &AsyncFd<MasterFd>,
    buf: &mut [u8],
    deadline: Duration,
) -> io::Result<Option<usize>> {
    match tokio::time::timeout(deadline, read_chunk(afd, buf)).await {
        Ok(result) => result.map(Some),
        Err(_elapsed) => Ok(None),
    }
}

/// Read one chunk from the master, waiting for readiness as needed.
pub async fn read_chunk(afd: &AsyncFd<MasterFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::read(inner, buf).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

/// Write all of `data` to the master. The caller serialises writers (the
/// injection gate); this only handles partial writes and readiness.
pub async fn write_all(afd: &AsyncFd<MasterFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| {
            let n = nix::unistd::write(inner, &data[offset..]).map_err(io_err)?;
            Ok(n)
        }) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
