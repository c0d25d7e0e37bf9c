use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::pty::openpty;

use super::terminal::{get_window_size, set_window_size};
use crate::error::{Result, SiphonError};
use crate::poll::{wait_readable, POLL_INTERVAL_MS};

/// Primary side of a pseudo-terminal pair, shared by the host's pumps.
///
/// `close` marks the device closed: blocked readers return end-of-stream
/// within one poll interval and writers fail. The descriptor itself is
/// released when the last handle drops.
pub struct PtyMaster {
    fd: OwnedFd,
    closed: AtomicBool,
}

impl PtyMaster {
    /// Allocate a PTY pair, returning the primary and the secondary side.
    pub fn open() -> Result<(Self, OwnedFd)> {
        let pair = openpty(None, None)
            .map_err(|e| SiphonError::PtyError(format!("Failed to open PTY: {}", e)))?;
        Ok((
            Self {
                fd: pair.master,
                closed: AtomicBool::new(false),
            },
            pair.slave,
        ))
    }

    /// Read PTY output. `Ok(0)` once the device is closed or the secondary
    /// side has hung up.
    pub fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.is_closed() {
                return Ok(0);
            }
            if !wait_readable(self.fd.as_fd(), POLL_INTERVAL_MS)? {
                continue;
            }

            let result = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buffer.as_mut_ptr() as *mut libc::c_void,
                    buffer.len(),
                )
            };
            if result >= 0 {
                return Ok(result as usize);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // Linux reports EIO once every secondary handle is closed.
                Some(libc::EIO) => return Ok(0),
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Write all of `data` into the PTY.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "PTY closed"));
            }
            let result = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            written += result as usize;
        }
        Ok(())
    }

    /// Apply a window size change to the device.
    pub fn resize(&self, height: u16, width: u16) -> Result<()> {
        if self.is_closed() {
            return Err(SiphonError::PtyError("PTY closed".to_string()));
        }
        set_window_size(self.fd.as_fd(), height, width)
            .map_err(|e| SiphonError::PtyError(format!("Failed to set PTY size: {}", e)))
    }

    /// Current (height, width) of the device.
    pub fn size(&self) -> Result<(u16, u16)> {
        get_window_size(self.fd.as_fd())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
