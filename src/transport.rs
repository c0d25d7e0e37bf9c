use std::fs;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::addr::{Address, Transport};
use crate::diag;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, SiphonError};
use crate::poll::{wait_readable, POLL_INTERVAL_MS};
use crate::wire::Connection;

/// A bound, non-blocking listener for a unix or tcp address.
pub enum Listener {
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `addr`. A stale unix socket file is replaced and the new one is
    /// restricted to `socket_mode`.
    pub fn bind(addr: &Address, socket_mode: u32) -> Result<Self> {
        let listen_err = |source: io::Error| SiphonError::Listen {
            label: addr.label().to_string(),
            source,
        };

        let listener = match addr.transport() {
            Transport::Unix => {
                let path = PathBuf::from(addr.location());
                if path.exists() {
                    fs::remove_file(&path).map_err(listen_err)?;
                }
                let listener = UnixListener::bind(&path).map_err(listen_err)?;

                let mut permissions = fs::metadata(&path).map_err(listen_err)?.permissions();
                permissions.set_mode(socket_mode);
                fs::set_permissions(&path, permissions).map_err(listen_err)?;

                listener.set_nonblocking(true).map_err(listen_err)?;
                Listener::Unix { listener, path }
            }
            Transport::Tcp => {
                let listener = TcpListener::bind(addr.location()).map_err(listen_err)?;
                listener.set_nonblocking(true).map_err(listen_err)?;
                Listener::Tcp(listener)
            }
            Transport::Internal => {
                return Err(listen_err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "in-process addresses have no listener",
                )))
            }
        };
        Ok(listener)
    }

    /// Where the listener actually ended up (resolves tcp port 0).
    pub fn location(&self) -> String {
        match self {
            Listener::Unix { path, .. } => path.display().to_string(),
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        }
    }

    /// Wait up to `timeout_ms` for a client. `Ok(None)` means nothing arrived
    /// in time.
    pub fn accept_timeout(&self, timeout_ms: i32) -> io::Result<Option<Connection>> {
        let ready = match self {
            Listener::Unix { listener, .. } => wait_readable(listener.as_fd(), timeout_ms)?,
            Listener::Tcp(listener) => wait_readable(listener.as_fd(), timeout_ms)?,
        };
        if !ready {
            return Ok(None);
        }

        let accepted = match self {
            Listener::Unix { listener, .. } => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                Connection::from_unix(stream)
            }),
            Listener::Tcp(listener) => listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                Connection::from_tcp(stream)
            }),
        };
        match accepted {
            Ok(conn) => Ok(Some(conn)),
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::ConnectionAborted =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

/// Background accept loop over a `Listener`.
///
/// Stopping is cooperative: the loop notices the stop flag within one poll
/// interval, exits cleanly and drops the listener. Any other accept failure
/// ends the loop with `SiphonError::Accept`, surfaced by `stop`.
pub struct AcceptLoop {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<()>>>,
    location: String,
}

impl AcceptLoop {
    pub fn spawn<F>(listener: Listener, diag: Diagnostics, mut on_accept: F) -> Result<Self>
    where
        F: FnMut(Connection) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let location = listener.location();
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(format!("siphon-accept-{}", diag.component()))
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    match listener.accept_timeout(POLL_INTERVAL_MS) {
                        Ok(Some(conn)) => {
                            diag!(diag, "accepted new client connection {}", conn.label());
                            on_accept(conn);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            diag!(diag, "accept failed: {}", e);
                            return Err(SiphonError::Accept(e));
                        }
                    }
                }
                diag!(diag, "listener on {} closed", listener.location());
                Ok(())
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            location,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// True once the loop has exited, for any reason.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Close the listener and report how the loop ended.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| SiphonError::ProcessError("accept loop panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for AcceptLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Open a connection to `addr`.
pub fn dial(addr: &Address) -> Result<Connection> {
    let dial_err = |source: io::Error| SiphonError::Dial {
        label: addr.label().to_string(),
        source,
    };
    match addr.transport() {
        Transport::Unix => UnixStream::connect(addr.location())
            .and_then(Connection::from_unix)
            .map_err(dial_err),
        Transport::Tcp => TcpStream::connect(addr.location())
            .and_then(Connection::from_tcp)
            .map_err(dial_err),
        Transport::Internal => Err(dial_err(io::Error::new(
            io::ErrorKind::Unsupported,
            "in-process addresses cannot be dialed",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_unix_socket_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("perm.sock");
        let addr = Address::new("perm", "unix", path.to_str().unwrap()).unwrap();

        let listener = Listener::bind(&addr, 0o600).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stale.sock");
        fs::write(&path, b"leftover").unwrap();
        let addr = Address::new("stale", "unix", path.to_str().unwrap()).unwrap();
        assert!(Listener::bind(&addr, 0o600).is_ok());
    }

    #[test]
    fn test_accept_timeout_and_dial() {
        let addr = Address::new("loop", "tcp", "127.0.0.1:0").unwrap();
        let listener = Listener::bind(&addr, 0o600).unwrap();
        assert!(listener.accept_timeout(10).unwrap().is_none());

        let bound = Address::new("loop", "tcp", listener.location()).unwrap();
        let client = dial(&bound).unwrap();
        let server = listener.accept_timeout(1000).unwrap().unwrap();

        client.encode(&crate::wire::Message::content(b"ping")).unwrap();
        let m: crate::wire::Message = server.decode().unwrap().unwrap();
        assert_eq!(m.content.unwrap(), b"ping");
    }

    #[test]
    fn test_accept_loop_stops_cleanly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loop.sock");
        let addr = Address::new("loop", "unix", path.to_str().unwrap()).unwrap();
        let listener = Listener::bind(&addr, 0o600).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let accept = AcceptLoop::spawn(listener, Diagnostics::discard("test"), move |conn| {
            tx.send(conn.label().to_string()).unwrap();
        })
        .unwrap();

        let _client = dial(&addr).unwrap();
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());

        assert!(accept.stop().is_ok());
        assert!(!path.exists());
        assert!(matches!(dial(&addr), Err(SiphonError::Dial { .. })));
    }

    #[test]
    fn test_dial_failures() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nobody.sock");
        let addr = Address::new("missing", "unix", missing.to_str().unwrap()).unwrap();
        assert!(matches!(dial(&addr), Err(SiphonError::Dial { .. })));
        assert!(matches!(
            dial(&Address::internal()),
            Err(SiphonError::Dial { .. })
        ));
    }

    #[test]
    fn test_accept_loop_reports_listener_failure() {
        use std::os::fd::AsRawFd;

        let addr = Address::new("broken", "tcp", "127.0.0.1:0").unwrap();
        let listener = Listener::bind(&addr, 0o600).unwrap();
        let fd = match &listener {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix { .. } => unreachable!(),
        };
        let accept = AcceptLoop::spawn(listener, Diagnostics::discard("test"), drop).unwrap();

        unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !accept.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(accept.is_finished());
        assert!(matches!(accept.stop(), Err(SiphonError::Accept(_))));
    }
}
