use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::addr::Address;
use crate::config::{ClientOptions, PIPE_CAPACITY};
use crate::diag;
use crate::diagnostics::Diagnostics;
use crate::error::{Result, SiphonError};
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::pty::signal::ResizeSignal;
use crate::pty::terminal::{get_window_size, is_terminal, RawModeGuard};
use crate::transport;
use crate::wire::{handshake, Connection, Message};

/// One attachment to a host session.
///
/// Two background loops move data: the decode loop turns content records
/// into bytes on `output()` and remembers the last size the host announced;
/// the encode loop frames whatever is written to `input()`. Dropping the
/// client (and every `input()` clone) ends the encode loop, which closes the
/// connection.
pub struct Client {
    conn: Arc<Connection>,
    input: PipeWriter,
    output: PipeReader,
    remote_size: Arc<Mutex<Option<(u16, u16)>>>,
    decode_loop: Option<JoinHandle<Result<()>>>,
    diag: Diagnostics,
}

impl Client {
    /// Dial `addr` and complete the handshake, following redirects.
    pub fn connect(addr: &Address, diag: Diagnostics) -> Result<Self> {
        Self::connect_with(addr, ClientOptions::default(), diag)
    }

    pub fn connect_with(addr: &Address, options: ClientOptions, diag: Diagnostics) -> Result<Self> {
        diag!(diag, "dialing {}", addr);
        let conn = transport::dial(addr)?;
        Self::over(conn, options, diag)
    }

    /// Handshake over an already open connection and start both loops.
    pub fn over(conn: Connection, options: ClientOptions, diag: Diagnostics) -> Result<Self> {
        let conn = handshake::initiate(conn, options.max_redirects, |next| {
            diag!(diag, "redirected to {}", next);
            transport::dial(next)
        })?;
        diag!(diag, "attached over {}", conn.label());

        let conn = Arc::new(conn);
        let remote_size = Arc::new(Mutex::new(None));
        let (output_writer, output) = pipe(PIPE_CAPACITY);
        let (input, input_reader) = pipe(PIPE_CAPACITY);

        let decode_loop = {
            let conn = Arc::clone(&conn);
            let remote_size = Arc::clone(&remote_size);
            let diag = diag.clone();
            thread::Builder::new()
                .name(format!("siphon-decode-{}", conn.label()))
                .spawn(move || decode_loop(&conn, output_writer, &remote_size, &diag))?
        };
        {
            let conn = Arc::clone(&conn);
            let diag = diag.clone();
            let chunk_size = options.chunk_size.max(1);
            thread::Builder::new()
                .name(format!("siphon-encode-{}", conn.label()))
                .spawn(move || encode_loop(&conn, input_reader, chunk_size, &diag))?;
        }

        Ok(Self {
            conn,
            input,
            output,
            remote_size,
            decode_loop: Some(decode_loop),
            diag,
        })
    }

    pub fn label(&self) -> &str {
        self.conn.label()
    }

    /// Bytes written here reach the host's PTY input.
    pub fn input(&self) -> PipeWriter {
        self.input.clone()
    }

    /// Host PTY output, from the moment of attachment. Ends when the host
    /// or the connection goes away.
    pub fn output(&self) -> PipeReader {
        self.output.clone()
    }

    /// Last (height, width) the host announced, if any.
    pub fn remote_size(&self) -> Option<(u16, u16)> {
        self.remote_size.lock().ok().and_then(|s| *s)
    }

    /// Ask the host to resize its PTY. `Ok(false)` when both dimensions are
    /// zero and nothing was sent.
    pub fn send_resize(&self, height: u16, width: u16) -> Result<bool> {
        send_size(&self.conn, height, width)
    }

    /// Send the size of the terminal behind `fd`.
    pub fn send_local_size(&self, fd: BorrowedFd<'_>) -> Result<bool> {
        let (height, width) = get_window_size(fd)?;
        self.send_resize(height, width)
    }

    /// Close the connection. The host session keeps running.
    pub fn close(&self) -> Result<()> {
        self.input.close();
        self.conn.close()?;
        Ok(())
    }

    /// Block until the host side stops sending. An error means the stream
    /// broke rather than ended.
    pub fn wait(&mut self) -> Result<()> {
        match self.decode_loop.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| SiphonError::ProcessError("decode loop panicked".to_string()))?,
            None => Ok(()),
        }
    }

    /// Put the local terminal in raw mode and relay it to the session until
    /// the remote side ends.
    ///
    /// The terminal is restored on every exit path. Local input is copied on
    /// a background thread that is not waited for, since a blocked terminal
    /// read cannot be interrupted.
    pub fn attach<R, W>(&self, local_input: R, mut local_output: W) -> Result<()>
    where
        R: Read + AsFd + Send + 'static,
        W: Write,
    {
        if !is_terminal(local_input.as_fd()) {
            return Err(SiphonError::NotATerminal);
        }
        let tty = local_input.as_fd().try_clone_to_owned()?;

        diag!(self.diag, "entering raw mode");
        let mut raw = RawModeGuard::enter(tty.as_fd())?;
        let relayed = self.relay(local_input, &mut local_output, tty);
        let restored = raw.restore();
        diag!(self.diag, "terminal restored");

        relayed.and(restored)
    }

    fn relay<R, W>(&self, local_input: R, local_output: &mut W, tty: OwnedFd) -> Result<()>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        self.send_local_size(tty.as_fd())?;

        let (signal, mut events) = ResizeSignal::install()?;
        {
            let conn = Arc::clone(&self.conn);
            let diag = self.diag.clone();
            thread::Builder::new()
                .name("siphon-resize".to_string())
                .spawn(move || {
                    while events.wait() {
                        let sent = get_window_size(tty.as_fd())
                            .and_then(|(height, width)| send_size(&conn, height, width));
                        if let Err(e) = sent {
                            diag!(diag, "resize not sent: {}", e);
                        }
                    }
                })?;
        }

        {
            let mut input = self.input();
            let diag = self.diag.clone();
            thread::Builder::new()
                .name("siphon-stdin".to_string())
                .spawn(move || {
                    let mut local_input = local_input;
                    if let Err(e) = io::copy(&mut local_input, &mut input) {
                        diag!(diag, "local input stopped: {}", e);
                    }
                    diag!(diag, "local input ended");
                })?;
        }

        let copied = copy_flushing(&mut self.output(), local_output);
        diag!(self.diag, "session output ended");
        drop(signal);
        copied.map_err(SiphonError::SessionIo)
    }
}

fn send_size(conn: &Connection, height: u16, width: u16) -> Result<bool> {
    if height == 0 && width == 0 {
        return Ok(false);
    }
    conn.encode(&Message::resize(height, width))
        .map_err(|e| SiphonError::SessionIo(e.into()))?;
    Ok(true)
}

/// Like `io::copy`, but flushes after every chunk so partial lines show up
/// on a line-buffered terminal.
fn copy_flushing<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<()> {
    let mut buffer = vec![0u8; PIPE_CAPACITY];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        writer.flush()?;
    }
}

fn decode_loop(
    conn: &Connection,
    output: PipeWriter,
    remote_size: &Mutex<Option<(u16, u16)>>,
    diag: &Diagnostics,
) -> Result<()> {
    let result = loop {
        let message: Message = match conn.decode() {
            Ok(Some(message)) => message,
            Ok(None) => {
                output.close();
                break Ok(());
            }
            Err(e) => {
                let err = io::Error::from(e);
                output.close_with_error(io::Error::new(err.kind(), err.to_string()));
                break Err(SiphonError::SessionIo(err));
            }
        };

        let size = message.size();
        match message.content {
            Some(content) => {
                let mut output = &output;
                if output.write_all(&content).is_err() {
                    diag!(diag, "output reader gone; dropping session");
                    break Ok(());
                }
            }
            None => {
                if let (Some(size), Ok(mut last)) = (size, remote_size.lock()) {
                    *last = Some(size);
                }
            }
        }
    };
    let _ = conn.close();
    diag!(diag, "decode loop for {} ended", conn.label());
    result
}

fn encode_loop(conn: &Connection, input: PipeReader, chunk_size: usize, diag: &Diagnostics) -> Result<()> {
    let mut buffer = vec![0u8; chunk_size];
    let mut reader = &input;
    let result = loop {
        match reader.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = conn.encode(&Message::content(&buffer[..n])) {
                    break Err(SiphonError::SessionIo(e.into()));
                }
            }
            Err(e) => break Err(SiphonError::SessionIo(e)),
        }
    };
    input.close();
    let _ = conn.close();
    if let Err(e) = &result {
        diag!(diag, "encode loop for {}: {}", conn.label(), e);
    }
    result
}
