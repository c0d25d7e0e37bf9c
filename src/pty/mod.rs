// Pseudo-terminal plumbing: the host's PTY device, spawning a child onto it,
// and the local terminal a client attaches to.
mod master;
pub mod signal;
mod spawn;
pub mod terminal;


// SIGWINCH handling is process-wide; tests that install it take this lock.
#[cfg(test)]
pub(crate) static SIGWINCH_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub use master::PtyMaster;
pub use spawn::spawn_on_pty;
