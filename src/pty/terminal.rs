use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use crossterm::tty::IsTty;
use nix::sys::termios::{tcflush, tcgetattr, tcsetattr, FlushArg, SetArg, Termios};
use nix::sys::termios::{
    ControlFlags, InputFlags, LocalFlags, OutputFlags, SpecialCharacterIndices,
};

use crate::error::{Result, SiphonError};

pub fn is_terminal(fd: BorrowedFd<'_>) -> bool {
    fd.is_tty()
}

/// Save the current terminal state
pub fn save_terminal_state(fd: BorrowedFd<'_>) -> Result<Termios> {
    tcgetattr(fd)
        .map_err(|e| SiphonError::TerminalError(format!("Failed to get terminal attributes: {}", e)))
}

/// Set terminal to raw mode
pub fn set_raw_mode(fd: BorrowedFd<'_>, original: &Termios) -> Result<()> {
    let mut raw = original.clone();
    raw.input_flags = InputFlags::empty();
    raw.output_flags = OutputFlags::empty();
    raw.control_flags |= ControlFlags::CS8;
    raw.local_flags = LocalFlags::empty();
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    tcsetattr(fd, SetArg::TCSANOW, &raw)
        .map_err(|e| SiphonError::TerminalError(format!("Failed to set raw mode: {}", e)))
}

/// Restore terminal to original state
pub fn restore_terminal(fd: BorrowedFd<'_>, original: &Termios) -> Result<()> {
    // Drop keystrokes typed while raw so they don't leak into the shell.
    let _ = tcflush(fd, FlushArg::TCIFLUSH);
    tcsetattr(fd, SetArg::TCSANOW, original)
        .map_err(|e| SiphonError::TerminalError(format!("Failed to restore terminal: {}", e)))
}

/// Raw mode for as long as the guard lives.
pub struct RawModeGuard {
    fd: OwnedFd,
    original: Termios,
    restored: bool,
}

impl RawModeGuard {
    /// Takes its own handle on the terminal so the caller's can move freely.
    pub fn enter(fd: BorrowedFd<'_>) -> Result<Self> {
        let fd = fd.try_clone_to_owned()?;
        let original = save_terminal_state(fd.as_fd())?;
        set_raw_mode(fd.as_fd(), &original)?;
        Ok(Self {
            fd,
            original,
            restored: false,
        })
    }

    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        restore_terminal(self.fd.as_fd(), &self.original)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

/// (height, width) of the terminal behind `fd`.
pub fn get_window_size(fd: BorrowedFd<'_>) -> Result<(u16, u16)> {
    unsafe {
        let mut winsize: libc::winsize = std::mem::zeroed();
        if libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ as _, &mut winsize) < 0 {
            return Err(SiphonError::TerminalError(format!(
                "Failed to get window size: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok((winsize.ws_row, winsize.ws_col))
    }
}

pub fn set_window_size(fd: BorrowedFd<'_>, height: u16, width: u16) -> std::io::Result<()> {
    unsafe {
        let winsize = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        if libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ as _, &winsize) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
