use std::sync::mpsc;

use siphon::{Address, Diagnostics, Result, Router, SiphonError};

use super::resolve_address;

/// Serves redirects until Ctrl+C.
pub fn handle_redirect(
    proto: &str,
    addr: Option<String>,
    label: String,
    to_proto: &str,
    to_addr: String,
    diag: &Diagnostics,
) -> Result<()> {
    let listen = resolve_address(proto, addr, label.clone())?;
    let target = Address::new(label, to_proto, to_addr)?;

    let mut router = Router::new(listen, target, diag.for_component("router"));
    router.serve()?;
    println!(
        "Redirecting {} to {}",
        router.location().unwrap_or_default(),
        router.target()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| SiphonError::ProcessError(format!("Failed to set Ctrl+C handler: {}", e)))?;

    let _ = rx.recv();
    router.un_serve()
}
