use std::thread;

use crate::addr::Address;
use crate::config::HostOptions;
use crate::diag;
use crate::diagnostics::Diagnostics;
use crate::error::Result;
use crate::transport::{AcceptLoop, Listener};
use crate::wire::handshake;

/// Answers every handshake on `listen` with a redirect to `target`.
///
/// Holds no session of its own; each connection is dropped once the
/// redirect has been sent.
pub struct Router {
    listen: Address,
    target: Address,
    options: HostOptions,
    diag: Diagnostics,
    listener: Option<AcceptLoop>,
}

impl Router {
    pub fn new(listen: Address, target: Address, diag: Diagnostics) -> Self {
        Self {
            listen,
            target,
            options: HostOptions::default(),
            diag,
            listener: None,
        }
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn serve(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = Listener::bind(&self.listen, self.options.socket_mode)?;
        diag!(self.diag, "redirecting {} to {}", listener.location(), self.target);

        let target = self.target.clone();
        let diag = self.diag.clone();
        let accept = AcceptLoop::spawn(listener, self.diag.clone(), move |conn| {
            let target = target.clone();
            let refer_diag = diag.clone();
            let spawned = thread::Builder::new()
                .name(format!("siphon-refer-{}", conn.label()))
                .spawn(move || match handshake::refer(&conn, &target) {
                    Ok(()) => diag!(refer_diag, "sent {} to {}", conn.label(), target),
                    Err(e) => diag!(refer_diag, "could not redirect {}: {}", conn.label(), e),
                });
            if let Err(e) = spawned {
                diag!(diag, "could not start redirect thread: {}", e);
            }
        })?;
        self.listener = Some(accept);
        Ok(())
    }

    pub fn un_serve(&mut self) -> Result<()> {
        match self.listener.take() {
            Some(accept) => accept.stop(),
            None => Ok(()),
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.listener.as_ref().map(|l| l.location())
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        let _ = self.un_serve();
    }
}
