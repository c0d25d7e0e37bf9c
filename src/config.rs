use std::fs;
use std::path::PathBuf;

use crate::error::{Result, SiphonError};

/// Bytes read per content record on the client's encode loop and the
/// host's outbound pump.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Redirect hops a client follows before giving up.
pub const DEFAULT_MAX_REDIRECTS: usize = 8;

/// Capacity of the in-process pipes between pumps.
pub const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Permissions applied to a bound unix socket.
    pub socket_mode: u32,
    /// Queue depth per client sink. `None` keeps fan-out synchronous, so a
    /// slow client paces the PTY.
    pub sink_buffer: Option<usize>,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            socket_mode: 0o600,
            sink_buffer: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub max_redirects: usize,
    pub chunk_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            chunk_size: CHUNK_SIZE,
        }
    }
}

/// `$SIPHON_HOME`, or `~/.siphon`. Created if missing.
pub fn home_dir() -> Result<PathBuf> {
    let dir = if let Ok(home) = std::env::var("SIPHON_HOME") {
        PathBuf::from(home)
    } else {
        directories::BaseDirs::new()
            .ok_or_else(|| SiphonError::Io(std::io::Error::other("could not find home directory")))?
            .home_dir()
            .join(".siphon")
    };

    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }

    Ok(dir)
}

pub fn default_socket_path() -> Result<PathBuf> {
    Ok(home_dir()?.join("siphon.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let host = HostOptions::default();
        assert_eq!(host.socket_mode, 0o600);
        assert!(host.sink_buffer.is_none());

        let client = ClientOptions::default();
        assert_eq!(client.chunk_size, 32 * 1024);
        assert_eq!(client.max_redirects, DEFAULT_MAX_REDIRECTS);
    }
}
