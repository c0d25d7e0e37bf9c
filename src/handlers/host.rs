use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use siphon::{Diagnostics, Host, Result, SiphonError};

use super::resolve_address;

/// Runs `command` on a PTY, serves it until the child exits, then tears
/// everything down. Ctrl+C stops accepting new clients.
pub fn handle_host(
    proto: &str,
    addr: Option<String>,
    label: String,
    command: Vec<String>,
    diag: &Diagnostics,
) -> Result<()> {
    let address = resolve_address(proto, addr, label)?;
    let (program, args) = command
        .split_first()
        .ok_or_else(|| SiphonError::ProcessError("no command given".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).env("SIPHON_LABEL", address.label());

    let mut host = Host::new(cmd, address.clone(), diag.for_component("host"));
    host.start()?;
    host.serve()?;
    println!(
        "Serving {} (pid {}) on {}",
        program,
        host.pid().unwrap_or_default(),
        host.location().unwrap_or(address.location())
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst))
            .map_err(|e| SiphonError::ProcessError(format!("Failed to set Ctrl+C handler: {}", e)))?;
    }

    let status = loop {
        if interrupted.swap(false, Ordering::SeqCst) && host.is_serving() {
            println!("Stopped accepting clients; waiting for {} to exit", program);
            host.un_serve()?;
        }
        if let Some(status) = host.try_wait()? {
            break status;
        }
        if let Err(e) = host.check_serving() {
            // Nobody new can attach; end the session instead of idling.
            eprintln!("Listener on {} failed: {}", address, e);
            let _ = host.kill();
            let _ = host.wait();
            host.cleanup();
            return Err(e);
        }
        thread::sleep(Duration::from_millis(100));
    };

    let served = host.un_serve();
    host.cleanup();
    served?;

    if let Some(fatal) = host.take_fatal() {
        return Err(fatal);
    }
    println!("{} exited with {}", program, status);
    Ok(())
}
