use std::io;

use siphon::{Client, Diagnostics, Result};

use super::resolve_address;

pub fn handle_attach(
    proto: &str,
    addr: Option<String>,
    label: String,
    diag: &Diagnostics,
) -> Result<()> {
    let address = resolve_address(proto, addr, label)?;
    let client = match Client::connect(&address, diag.for_component("client")) {
        Ok(client) => client,
        Err(e) => {
            if e.is_handshake() {
                eprintln!("Could not reach a session at {}", address);
            }
            return Err(e);
        }
    };

    client.attach(io::stdin(), io::stdout())?;
    println!("\r\n[detached from {}]", address);
    Ok(())
}
