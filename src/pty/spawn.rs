use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::unistd::setsid;

use crate::error::{Result, SiphonError};

/// Start `command` with the PTY secondary side as its stdin, stdout and
/// stderr, as session leader with the PTY as controlling terminal.
///
/// The command and `slave` are consumed, so this process holds no handle to
/// the secondary side once the child is running.
pub fn spawn_on_pty(mut command: Command, slave: OwnedFd) -> Result<Child> {
    let stdin = slave.try_clone()?;
    let stdout = slave.try_clone()?;

    command
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(slave));

    // Runs in the child after stdio has been redirected, so fd 0 is the PTY.
    unsafe {
        command.pre_exec(|| {
            setsid().map_err(io::Error::from)?;
            if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    command
        .spawn()
        .map_err(|e| SiphonError::ProcessError(format!("Failed to start {:?}: {}", command, e)))
}
