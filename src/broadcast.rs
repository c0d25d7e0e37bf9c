use std::io::{self, Write};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};
use std::thread;

use crate::pipe::PipeWriter;

/// A sink that can be told it will receive no more data.
pub trait WriteCloser: Write + Send {
    fn close(&mut self) -> io::Result<()>;
}

impl WriteCloser for PipeWriter {
    fn close(&mut self) -> io::Result<()> {
        PipeWriter::close(self);
        Ok(())
    }
}

pub type SinkId = u64;

struct Registry {
    // `None` once closed for good.
    writers: Option<Vec<(SinkId, Box<dyn WriteCloser>)>>,
    next_id: SinkId,
}

/// Replicates one producer's bytes to every registered sink.
///
/// Sinks are written in registration order under a single lock that also
/// guards membership. A sink that errors or accepts fewer bytes than offered
/// is evicted and closed; the producer always sees a full write.
pub struct WriteBroadcaster {
    registry: Mutex<Registry>,
}

impl Default for WriteBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBroadcaster {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                writers: Some(Vec::new()),
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a sink. After `close_writers` the sink is closed at once instead
    /// and `None` is returned.
    pub fn register(&self, mut sink: Box<dyn WriteCloser>) -> Option<SinkId> {
        let mut registry = self.lock();
        let id = registry.next_id;
        match registry.writers.as_mut() {
            Some(writers) => {
                writers.push((id, sink));
                registry.next_id += 1;
                Some(id)
            }
            None => {
                let _ = sink.close();
                None
            }
        }
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut registry = self.lock();
        if let Some(writers) = registry.writers.as_mut() {
            writers.retain_mut(|(_, sink)| match sink.write(data) {
                Ok(n) if n == data.len() => true,
                _ => {
                    let _ = sink.close();
                    false
                }
            });
        }
        Ok(data.len())
    }

    /// Close and drop every sink, then refuse all future registrations.
    pub fn close_writers(&self) {
        let mut registry = self.lock();
        if let Some(writers) = registry.writers.take() {
            for (_, mut sink) in writers {
                let _ = sink.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().writers.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().writers.is_none()
    }

    pub fn contains(&self, id: SinkId) -> bool {
        self.lock()
            .writers
            .as_ref()
            .is_some_and(|writers| writers.iter().any(|(sid, _)| *sid == id))
    }
}

impl Write for &WriteBroadcaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WriteBroadcaster::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decouples a sink from the broadcast with a bounded queue of chunks.
///
/// A full queue fails the write, so a sink that falls `depth` chunks behind
/// is evicted rather than stalling the producer.
pub struct BufferedSink {
    queue: Option<SyncSender<Vec<u8>>>,
}

impl BufferedSink {
    pub fn new(mut inner: Box<dyn WriteCloser>, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(depth.max(1));
        thread::spawn(move || {
            for chunk in rx {
                if inner.write_all(&chunk).is_err() {
                    break;
                }
            }
            let _ = inner.close();
        });
        Self { queue: Some(tx) }
    }
}

impl Write for BufferedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))?;
        match queue.try_send(buf.to_vec()) {
            Ok(()) => Ok(buf.len()),
            Err(TrySendError::Full(_)) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "sink queue full",
            )),
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "sink gone",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteCloser for BufferedSink {
    fn close(&mut self) -> io::Result<()> {
        self.queue.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use std::io::Read;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorded {
        data: Vec<u8>,
        closed: bool,
        writes: usize,
    }

    /// Test sink: records what it receives; can fail or go short on a
    /// chosen write.
    struct RecordingSink {
        recorded: Arc<Mutex<Recorded>>,
        fail_on: Option<usize>,
        short_on: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> (Self, Arc<Mutex<Recorded>>) {
            let recorded = Arc::new(Mutex::new(Recorded::default()));
            (
                Self {
                    recorded: Arc::clone(&recorded),
                    fail_on: None,
                    short_on: None,
                },
                recorded,
            )
        }
    }

    impl Write for RecordingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut recorded = self.recorded.lock().unwrap();
            let nth = recorded.writes;
            recorded.writes += 1;
            if self.fail_on == Some(nth) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"));
            }
            if self.short_on == Some(nth) {
                let half = buf.len() / 2;
                recorded.data.extend_from_slice(&buf[..half]);
                return Ok(half);
            }
            recorded.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteCloser for RecordingSink {
        fn close(&mut self) -> io::Result<()> {
            self.recorded.lock().unwrap().closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_write_without_sinks_reports_full_length() {
        let bc = WriteBroadcaster::new();
        assert_eq!(bc.write(b"twelve bytes").unwrap(), 12);
        assert!(bc.is_empty());
    }

    #[test]
    fn test_every_sink_gets_identical_bytes() {
        let bc = WriteBroadcaster::new();
        let logs: Vec<_> = (0..3)
            .map(|_| {
                let (sink, recorded) = RecordingSink::new();
                bc.register(Box::new(sink)).unwrap();
                recorded
            })
            .collect();

        bc.write(b"abc").unwrap();
        bc.write(b"def").unwrap();

        for recorded in logs {
            let recorded = recorded.lock().unwrap();
            assert_eq!(recorded.data, b"abcdef");
            assert!(!recorded.closed);
        }
        assert_eq!(bc.len(), 3);
    }

    #[test]
    fn test_failing_sink_is_evicted() {
        let bc = WriteBroadcaster::new();
        let (healthy, healthy_log) = RecordingSink::new();
        let (mut failing, failing_log) = RecordingSink::new();
        failing.fail_on = Some(1);
        let (mut short, short_log) = RecordingSink::new();
        short.short_on = Some(0);

        bc.register(Box::new(healthy)).unwrap();
        let failing_id = bc.register(Box::new(failing)).unwrap();
        let short_id = bc.register(Box::new(short)).unwrap();

        assert_eq!(bc.write(b"one").unwrap(), 3);
        assert!(!bc.contains(short_id));
        assert_eq!(bc.write(b"two").unwrap(), 3);
        assert!(!bc.contains(failing_id));
        assert_eq!(bc.write(b"three").unwrap(), 5);

        assert_eq!(healthy_log.lock().unwrap().data, b"onetwothree");

        let failing = failing_log.lock().unwrap();
        assert_eq!(failing.data, b"one");
        assert!(failing.closed);
        assert_eq!(failing.writes, 2);

        let short = short_log.lock().unwrap();
        assert!(short.closed);
        assert_eq!(short.writes, 1);
        assert_eq!(bc.len(), 1);
    }

    #[test]
    fn test_close_then_register_closes_immediately() {
        let bc = WriteBroadcaster::new();
        let (early, early_log) = RecordingSink::new();
        bc.register(Box::new(early)).unwrap();

        bc.close_writers();
        assert!(early_log.lock().unwrap().closed);
        assert!(bc.is_closed());

        let (late, late_log) = RecordingSink::new();
        assert!(bc.register(Box::new(late)).is_none());
        assert_eq!(bc.write(b"after close").unwrap(), 11);

        let late = late_log.lock().unwrap();
        assert!(late.closed);
        assert!(late.data.is_empty());
        assert_eq!(late.writes, 0);
    }

    #[test]
    fn test_pipe_sink_sees_eof_on_close() {
        let bc = WriteBroadcaster::new();
        let (w, mut r) = pipe(1024);
        bc.register(Box::new(w)).unwrap();
        bc.write(b"frame").unwrap();
        bc.close_writers();

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"frame");
    }

    #[test]
    fn test_late_pipe_sink_reads_nothing() {
        let bc = WriteBroadcaster::new();
        bc.write(b"before").unwrap();
        let (w, mut r) = pipe(1024);
        bc.register(Box::new(w)).unwrap();
        bc.write(b"after").unwrap();
        bc.close_writers();

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"after");
    }

    #[test]
    fn test_buffered_sink_evicts_when_queue_fills() {
        let bc = WriteBroadcaster::new();
        // Reader never drains, so the inner pipe fills and the queue backs up.
        let (w, r) = pipe(4);
        let id = bc
            .register(Box::new(BufferedSink::new(Box::new(w), 2)))
            .unwrap();

        for _ in 0..16 {
            bc.write(b"xxxxxxxx").unwrap();
            if !bc.contains(id) {
                break;
            }
        }
        assert!(!bc.contains(id));
        drop(r);
    }
}
