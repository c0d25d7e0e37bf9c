use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::pipe;

use crate::error::{Result, SiphonError};

// Write end of the self-pipe the handler pokes; -1 when no listener is live.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

// Handlers currently between loading WAKE_FD and finishing their write.
// The write end is only closed once this drops to zero.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_sigwinch(_: libc::c_int) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}

/// Installed SIGWINCH handler. Dropping it restores the previous handler
/// and ends the paired `ResizeEvents`.
///
/// Only one can be installed per process at a time.
pub struct ResizeSignal {
    wake: Option<OwnedFd>,
    previous: SigAction,
}

/// Receiving side of `ResizeSignal`, meant to be moved to a listener thread.
pub struct ResizeEvents {
    read: File,
}

impl ResizeSignal {
    pub fn install() -> Result<(ResizeSignal, ResizeEvents)> {
        let (read, write) = pipe()?;

        // The handler must never block on a full pipe.
        let flags = fcntl(write.as_raw_fd(), FcntlArg::F_GETFL)?;
        fcntl(
            write.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )?;

        if WAKE_FD
            .compare_exchange(-1, write.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SiphonError::TerminalError(
                "resize listener already installed".to_string(),
            ));
        }

        let action = SigAction::new(
            SigHandler::Handler(on_sigwinch),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let previous = match unsafe { sigaction(Signal::SIGWINCH, &action) } {
            Ok(previous) => previous,
            Err(e) => {
                WAKE_FD.store(-1, Ordering::SeqCst);
                return Err(SiphonError::TerminalError(format!(
                    "Failed to install SIGWINCH handler: {}",
                    e
                )));
            }
        };

        Ok((
            ResizeSignal {
                wake: Some(write),
                previous,
            },
            ResizeEvents {
                read: File::from(read),
            },
        ))
    }
}

impl Drop for ResizeSignal {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGWINCH, &self.previous) };
        WAKE_FD.store(-1, Ordering::SeqCst);
        // A handler on another thread may still hold the old descriptor.
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
        // Closing the write end gives the listener end-of-stream.
        self.wake.take();
    }
}

impl ResizeEvents {
    /// Block until the next window change. `false` once the signal has been
    /// uninstalled. Each delivered signal wakes exactly one call.
    pub fn wait(&mut self) -> bool {
        let mut buf = [0u8; 1];
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => return false,
                Ok(_) => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return false,
            }
        }
    }
}

/// True while no handler is mid-write.
#[cfg(test)]
pub(crate) fn quiescent() -> bool {
    IN_FLIGHT.load(Ordering::SeqCst) == 0 && WAKE_FD.load(Ordering::SeqCst) == -1
}
