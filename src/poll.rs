use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd};

/// How long blocking loops wait before rechecking their stop flag.
pub const POLL_INTERVAL_MS: i32 = 100;

/// Wait until `fd` is readable (or hung up) or `timeout_ms` passes.
///
/// Returns `Ok(false)` on timeout or interruption.
pub fn wait_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_timeout_then_ready() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!wait_readable(b.as_fd(), 10).unwrap());
        a.write_all(b"x").unwrap();
        assert!(wait_readable(b.as_fd(), 1000).unwrap());
    }
}
