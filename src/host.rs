use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, ExitStatus};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::addr::Address;
use crate::broadcast::{BufferedSink, WriteBroadcaster, WriteCloser};
use crate::client::Client;
use crate::config::{ClientOptions, HostOptions, CHUNK_SIZE, PIPE_CAPACITY};
use crate::diag;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, SiphonError};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::pty::{spawn_on_pty, PtyMaster};
use crate::transport::{AcceptLoop, Listener};
use crate::wire::{handshake, Connection, Message};

/// Owns one command running on a PTY and shares it with every attached
/// client.
///
/// Lifecycle: `new` (idle), `start` (running), `serve` (listening),
/// `un_serve` (stopped listening). The child keeps running across serve
/// transitions; `cleanup` tears the session down.
pub struct Host {
    address: Address,
    command: Option<Command>,
    child: Option<Child>,
    listener: Option<AcceptLoop>,
    shared: Arc<HostShared>,
}

/// State reached from pumps and per-connection sessions.
struct HostShared {
    label: String,
    options: HostOptions,
    diag: Diagnostics,
    stdout: WriteBroadcaster,
    stdin: PipeWriter,
    stdin_reader: PipeReader,
    pty: Mutex<Option<Arc<PtyMaster>>>,
    fatal: Mutex<Option<SiphonError>>,
}

impl Host {
    pub fn new(command: Command, address: Address, diag: Diagnostics) -> Self {
        Self::with_options(command, address, HostOptions::default(), diag)
    }

    pub fn with_options(
        command: Command,
        address: Address,
        options: HostOptions,
        diag: Diagnostics,
    ) -> Self {
        let (stdin, stdin_reader) = pipe(PIPE_CAPACITY);
        let shared = Arc::new(HostShared {
            label: address.label().to_string(),
            options,
            diag,
            stdout: WriteBroadcaster::new(),
            stdin,
            stdin_reader,
            pty: Mutex::new(None),
            fatal: Mutex::new(None),
        });

        Self {
            address,
            command: Some(command),
            child: None,
            listener: None,
            shared,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Open the PTY, start both pumps and launch the child on it.
    pub fn start(&mut self) -> Result<()> {
        let command = self
            .command
            .take()
            .ok_or_else(|| SiphonError::ProcessError("host already started".to_string()))?;

        let (master, slave) = PtyMaster::open()?;
        let master = Arc::new(master);
        if let Ok(mut pty) = self.shared.pty.lock() {
            *pty = Some(Arc::clone(&master));
        }

        {
            let shared = Arc::clone(&self.shared);
            let pty = Arc::clone(&master);
            thread::Builder::new()
                .name("siphon-pty-out".to_string())
                .spawn(move || shared.pump_pty_output(&pty))?;
        }
        {
            let shared = Arc::clone(&self.shared);
            let pty = Arc::clone(&master);
            thread::Builder::new()
                .name("siphon-pty-in".to_string())
                .spawn(move || shared.pump_pty_input(&pty))?;
        }

        match spawn_on_pty(command, slave) {
            Ok(child) => {
                diag!(self.shared.diag, "started {} as pid {}", self.shared.label, child.id());
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                diag!(self.shared.diag, "failed to start command: {}", e);
                self.shared.cleanup();
                Err(e)
            }
        }
    }

    /// Begin accepting remote clients. An in-process address has nothing to
    /// listen on and only reaches clients made by `open_local`.
    pub fn serve(&mut self) -> Result<()> {
        if self.address.is_internal() {
            diag!(self.shared.diag, "{} is in-process; not listening", self.address);
            return Ok(());
        }
        if self.listener.is_some() {
            return Ok(());
        }

        let listener = Listener::bind(&self.address, self.shared.options.socket_mode)?;
        diag!(self.shared.diag, "listening on {}", listener.location());

        let shared = Arc::clone(&self.shared);
        let diag = self.shared.diag.clone();
        let accept = AcceptLoop::spawn(listener, self.shared.diag.clone(), move |conn| {
            let session = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("siphon-session-{}", conn.label()))
                .spawn(move || session.handle_remote_client(conn));
            if let Err(e) = spawned {
                diag!(diag, "could not start session thread: {}", e);
            }
        })?;
        self.listener = Some(accept);
        Ok(())
    }

    /// Stop accepting new clients. Sessions already attached keep running.
    ///
    /// Returns the accept loop's own failure if it died before being asked
    /// to stop.
    pub fn un_serve(&mut self) -> Result<()> {
        match self.listener.take() {
            Some(accept) => {
                let result = accept.stop();
                diag!(self.shared.diag, "stopped serving {}", self.address);
                result
            }
            None => Ok(()),
        }
    }

    /// Reap an accept loop that ended without being asked to stop and
    /// report why. `Ok` while still listening or when never serving.
    pub fn check_serving(&mut self) -> Result<()> {
        if !self.listener.as_ref().is_some_and(|l| l.is_finished()) {
            return Ok(());
        }
        self.un_serve()?;
        Err(SiphonError::Accept(io::Error::new(
            io::ErrorKind::Other,
            "listener stopped unexpectedly",
        )))
    }

    pub fn is_serving(&self) -> bool {
        self.listener.as_ref().is_some_and(|l| !l.is_finished())
    }

    /// Where the listener is bound, with tcp port 0 resolved.
    pub fn location(&self) -> Option<&str> {
        self.listener.as_ref().map(|l| l.location())
    }

    pub fn resize(&self, height: u16, width: u16) -> Result<()> {
        self.shared.resize(height, width)
    }

    /// Write side of the PTY input, for local keystrokes.
    pub fn stdin_pipe(&self) -> PipeWriter {
        self.shared.stdin.clone()
    }

    /// A fresh subscriber to PTY output, from this point on.
    pub fn stdout_pipe(&self) -> PipeReader {
        self.shared.subscribe()
    }

    /// Attach an in-process client over a socket pair, without a listener.
    pub fn open_local(&self, diag: Diagnostics) -> Result<Client> {
        let (near, far) = UnixStream::pair()?;
        let far = Connection::from_unix(far)?;

        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(format!("siphon-session-{}", far.label()))
            .spawn(move || shared.handle_remote_client(far))?;

        Client::over(Connection::from_unix(near)?, ClientOptions::default(), diag)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(|c| c.id())
    }

    /// Block until the child exits.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SiphonError::ProcessError("host not started".to_string()))?;
        child
            .wait()
            .map_err(|e| SiphonError::ProcessError(format!("Failed to wait for child: {}", e)))
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| SiphonError::ProcessError(format!("Failed to poll child: {}", e))),
            None => Ok(None),
        }
    }

    pub fn kill(&mut self) -> Result<()> {
        match self.child.as_mut() {
            Some(child) => child
                .kill()
                .map_err(|e| SiphonError::ProcessError(format!("Failed to kill child: {}", e))),
            None => Ok(()),
        }
    }

    /// The failure that tore the session down, if any.
    pub fn take_fatal(&self) -> Option<SiphonError> {
        self.shared.fatal.lock().ok().and_then(|mut f| f.take())
    }

    /// Close PTY input, release every output subscriber and close the PTY.
    pub fn cleanup(&self) {
        self.shared.cleanup();
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let _ = self.un_serve();
        // Pumps hold their own references; closing the PTY and input ends them.
        self.shared.cleanup();
    }
}

impl HostShared {
    fn subscribe(&self) -> PipeReader {
        let (writer, reader) = pipe(PIPE_CAPACITY);
        let sink: Box<dyn WriteCloser> = match self.options.sink_buffer {
            Some(depth) => Box::new(BufferedSink::new(Box::new(writer), depth)),
            None => Box::new(writer),
        };
        if self.stdout.register(sink).is_none() {
            diag!(self.diag, "output already closed; subscriber ends immediately");
        }
        reader
    }

    fn pty(&self) -> Option<Arc<PtyMaster>> {
        self.pty.lock().ok().and_then(|p| p.clone())
    }

    fn resize(&self, height: u16, width: u16) -> Result<()> {
        let pty = self
            .pty()
            .ok_or_else(|| SiphonError::PtyError("PTY not open".to_string()))?;
        pty.resize(height, width)?;
        diag!(self.diag, "resized to {}x{}", height, width);
        Ok(())
    }

    /// Record `err` as the session's fatal error and tear it down.
    fn fail(&self, err: SiphonError) {
        diag!(self.diag, "fatal: {}", err);
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.cleanup();
    }

    fn cleanup(&self) {
        self.stdin_reader.close();
        diag!(self.diag, "closed PTY input");

        self.stdout.close_writers();
        diag!(self.diag, "released output subscribers");

        match self.pty.lock() {
            Ok(mut pty) => {
                if let Some(pty) = pty.take() {
                    pty.close();
                    diag!(self.diag, "closed PTY");
                }
            }
            Err(_) => diag!(self.diag, "PTY lock poisoned; not closed"),
        }
    }

    fn pump_pty_output(&self, pty: &PtyMaster) {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            match pty.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.stdout.write(&buffer[..n]);
                }
                Err(e) => {
                    diag!(self.diag, "PTY read failed: {}", e);
                    break;
                }
            }
        }
        self.stdout.close_writers();
        // The child is gone, so nothing will read further input.
        self.stdin_reader.close();
        diag!(self.diag, "PTY output ended");
    }

    fn pump_pty_input(&self, pty: &PtyMaster) {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut input = &self.stdin_reader;
        loop {
            match input.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = pty.write_all(&buffer[..n]) {
                        diag!(self.diag, "PTY write failed: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    diag!(self.diag, "PTY input failed: {}", e);
                    break;
                }
            }
        }
        self.stdin_reader.close();
        diag!(self.diag, "PTY input ended");
    }

    /// Serve one connection until either direction ends.
    fn handle_remote_client(self: Arc<Self>, conn: Connection) {
        let label = conn.label().to_string();

        if let Err(e) = handshake::await_hello(&conn) {
            diag!(self.diag, "handshake with {} failed: {}", label, e);
            let _ = conn.close();
            return;
        }
        // Subscribe before acknowledging so output produced after the client
        // learns it is attached always reaches it.
        let output = self.subscribe();
        if let Err(e) = handshake::accept(&conn) {
            diag!(self.diag, "handshake with {} failed: {}", label, e);
            output.close();
            let _ = conn.close();
            return;
        }
        diag!(self.diag, "client {} attached", label);

        let conn = Arc::new(conn);
        let inbound = {
            let shared = Arc::clone(&self);
            let conn = Arc::clone(&conn);
            let output = output.clone();
            thread::Builder::new()
                .name(format!("siphon-inbound-{}", label))
                .spawn(move || {
                    let result = shared.pump_inbound(&conn);
                    // Unblocks the outbound pump.
                    let _ = conn.close();
                    output.close();
                    result
                })
        };
        let inbound = match inbound {
            Ok(handle) => handle,
            Err(e) => {
                diag!(self.diag, "client {}: {}", label, e);
                output.close();
                let _ = conn.close();
                return;
            }
        };

        if let Err(e) = pump_outbound(&conn, &output) {
            diag!(self.diag, "client {} output: {}", label, e);
        }
        let _ = conn.close();
        output.close();

        match inbound.join() {
            Ok(Err(e)) => diag!(self.diag, "client {} input: {}", label, e),
            Ok(Ok(())) => {}
            Err(_) => diag!(self.diag, "client {} input pump panicked", label),
        }
        diag!(self.diag, "client {} detached", label);
    }

    fn pump_inbound(&self, conn: &Connection) -> Result<()> {
        let mut apply_resize = |height, width| match self.resize(height, width) {
            Ok(()) => Ok(()),
            Err(e) => {
                let message = e.to_string();
                self.fail(e);
                Err(SiphonError::PtyError(message))
            }
        };

        loop {
            let message: Message = match conn.decode() {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) => return Err(SiphonError::SessionIo(e.into())),
            };
            route_inbound(message, &self.stdin, &mut apply_resize)?;
        }
    }
}

/// Apply one client record: content goes to PTY input, otherwise a nonzero
/// size resizes the PTY. Content wins when a record carries both.
fn route_inbound<F>(message: Message, input: &PipeWriter, resize: &mut F) -> Result<()>
where
    F: FnMut(u16, u16) -> Result<()>,
{
    let size = message.size();
    match message.content {
        Some(content) if !content.is_empty() => {
            let mut input = input;
            input.write_all(&content).map_err(SiphonError::SessionIo)
        }
        _ => match size {
            Some((height, width)) => resize(height, width),
            None => Ok(()),
        },
    }
}

fn pump_outbound(conn: &Connection, output: &PipeReader) -> Result<()> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut output = output;
    loop {
        let n = output.read(&mut buffer).map_err(SiphonError::SessionIo)?;
        if n == 0 {
            return Ok(());
        }
        conn.encode(&Message::content(&buffer[..n]))
            .map_err(|e| SiphonError::SessionIo(e.into()))?;
    }
}
