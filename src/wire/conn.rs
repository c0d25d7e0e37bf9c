use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::de::IoRead;
use uuid::Uuid;

type Decoder = serde_json::Deserializer<IoRead<BufReader<Box<dyn Read + Send>>>>;
type Closer = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

/// Thread-safe framed channel over one byte stream.
///
/// Records are JSON values written back to back. Decoding and encoding each
/// have their own lock, so one reader and one writer can run at once while
/// concurrent callers in the same direction never interleave records.
pub struct Connection {
    label: String,
    decoder: Mutex<Decoder>,
    encoder: Mutex<Box<dyn Write + Send>>,
    closer: Closer,
    closed: AtomicBool,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Connection {
    pub fn new(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
        closer: impl Fn() -> io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        let reader: Box<dyn Read + Send> = Box::new(reader);
        Self {
            label: Uuid::new_v4().to_string()[..8].to_string(),
            decoder: Mutex::new(serde_json::Deserializer::from_reader(BufReader::new(reader))),
            encoder: Mutex::new(Box::new(writer)),
            closer: Box::new(closer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_unix(stream: UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Ok(Self::new(reader, stream, move || {
            shutdown_quietly(closer.shutdown(Shutdown::Both))
        }))
    }

    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;
        Ok(Self::new(reader, stream, move || {
            shutdown_quietly(closer.shutdown(Shutdown::Both))
        }))
    }

    /// Diagnostic name; carries no identity.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until one full record arrives.
    ///
    /// `Ok(None)` is a clean end-of-stream at a record boundary. A stream
    /// that ends inside a record is an error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        let mut decoder = relock(&self.decoder);
        match decoder.end() {
            Ok(()) => return Ok(None),
            Err(e) if e.is_io() => return Err(e),
            // Something other than whitespace is waiting: a record.
            Err(_) => {}
        }
        T::deserialize(&mut *decoder).map(Some)
    }

    /// Serialize and write one record atomically with respect to other
    /// encoders on this connection.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<(), serde_json::Error> {
        let mut record = serde_json::to_vec(value)?;
        record.push(b'\n');
        let mut encoder = relock(&self.encoder);
        encoder
            .write_all(&record)
            .and_then(|_| encoder.flush())
            .map_err(serde_json::Error::io)
    }

    /// Close the underlying stream. Later calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        (self.closer)()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// A peer that already went away leaves nothing to shut down.
fn shutdown_quietly(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}
