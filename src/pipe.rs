use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Bounded in-memory byte pipe connecting two threads.
///
/// Writers block until their whole buffer has been queued, so a write never
/// comes back short. The pipe closes for readers once every `PipeWriter`
/// clone is dropped or one of them calls `close`; it closes for writers once
/// every `PipeReader` clone is dropped or one of them calls `close`.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::with_capacity(capacity.min(64 * 1024)),
            writers: 1,
            readers: 1,
            write_closed: false,
            read_closed: false,
            error: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        capacity: capacity.max(1),
    });
    (
        PipeWriter {
            shared: Arc::clone(&shared),
        },
        PipeReader { shared },
    )
}

struct State {
    buffer: VecDeque<u8>,
    writers: usize,
    readers: usize,
    write_closed: bool,
    read_closed: bool,
    error: Option<(io::ErrorKind, String)>,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned pipe is still structurally valid; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_write(&self, error: Option<(io::ErrorKind, String)>) {
        let mut state = self.lock();
        if !state.write_closed {
            state.write_closed = true;
            state.error = error;
        }
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn close_read(&self) {
        let mut state = self.lock();
        state.read_closed = true;
        state.buffer.clear();
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
    }
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Readers drain what is queued, then see end-of-stream.
    pub fn close(&self) {
        self.shared.close_write(None);
    }

    /// Readers drain what is queued, then see `err`.
    pub fn close_with_error(&self, err: io::Error) {
        self.shared
            .close_write(Some((err.kind(), err.to_string())));
    }

    pub fn is_closed(&self) -> bool {
        let state = self.shared.lock();
        state.write_closed || state.read_closed
    }

    fn write_all_blocking(&self, data: &[u8]) -> io::Result<usize> {
        let mut offset = 0;
        let mut state = self.shared.lock();
        while offset < data.len() {
            if state.read_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "read side of pipe closed",
                ));
            }
            if state.write_closed {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "write on closed pipe",
                ));
            }

            let room = self.shared.capacity.saturating_sub(state.buffer.len());
            if room == 0 {
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            }

            let n = room.min(data.len() - offset);
            state.buffer.extend(&data[offset..offset + n]);
            offset += n;
            self.shared.readable.notify_all();
        }
        Ok(data.len())
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        self.shared.lock().writers += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.writers -= 1;
            state.writers == 0
        };
        if last {
            self.shared.close_write(None);
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_blocking(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_all_blocking(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Wake blocked readers with end-of-stream and fail further writes.
    pub fn close(&self) {
        self.shared.close_read();
    }

    fn read_blocking(&self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.lock();
        loop {
            if state.read_closed {
                return Ok(0);
            }
            if !state.buffer.is_empty() {
                let n = out.len().min(state.buffer.len());
                for (slot, byte) in out.iter_mut().zip(state.buffer.drain(..n)) {
                    *slot = byte;
                }
                self.shared.writable.notify_all();
                return Ok(n);
            }
            if state.write_closed {
                return match &state.error {
                    Some((kind, msg)) => Err(io::Error::new(*kind, msg.clone())),
                    None => Ok(0),
                };
            }
            state = self
                .shared
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Clone for PipeReader {
    fn clone(&self) -> Self {
        self.shared.lock().readers += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let last = {
            let mut state = self.shared.lock();
            state.readers -= 1;
            state.readers == 0
        };
        if last {
            self.shared.close_read();
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl Read for &PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}
