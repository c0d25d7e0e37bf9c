use std::path::Path;

use siphon::config::default_socket_path;
use siphon::{Address, Diagnostics, Result};
use tracing_subscriber::EnvFilter;

pub mod attach;
pub mod host;
pub mod redirect;

pub use attach::handle_attach;
pub use host::handle_host;
pub use redirect::handle_redirect;

/// Diagnostics go to `log_file` when given, otherwise through a
/// `tracing` subscriber on stderr filtered by `RUST_LOG`.
pub fn init_diagnostics(verbose: bool, log_file: Option<&Path>) -> Result<Diagnostics> {
    if let Some(path) = log_file {
        return Ok(Diagnostics::file("siphon", path)?);
    }

    let filter = if verbose {
        EnvFilter::new("siphon=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("siphon=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    Ok(Diagnostics::tracing("siphon"))
}

/// Build an address from CLI flags, falling back to the default socket.
pub fn resolve_address(proto: &str, addr: Option<String>, label: String) -> Result<Address> {
    let location = match addr {
        Some(addr) => addr,
        None => default_socket_path()?.display().to_string(),
    };
    Address::new(label, proto, location)
}
