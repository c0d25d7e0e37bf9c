use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Line-oriented diagnostic handle injected into each component.
///
/// Cloning is cheap; clones share the same underlying sink.
#[derive(Clone)]
pub struct Diagnostics {
    component: &'static str,
    sink: Sink,
}

#[derive(Clone)]
enum Sink {
    Discard,
    Tracing,
    Writer(Arc<Mutex<Box<dyn Write + Send>>>),
}

impl Diagnostics {
    /// Write timestamped lines to `writer`.
    pub fn new(component: &'static str, writer: impl Write + Send + 'static) -> Self {
        Self {
            component,
            sink: Sink::Writer(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    /// Route lines through `tracing` at debug level.
    pub fn tracing(component: &'static str) -> Self {
        Self {
            component,
            sink: Sink::Tracing,
        }
    }

    pub fn discard(component: &'static str) -> Self {
        Self {
            component,
            sink: Sink::Discard,
        }
    }

    /// Append lines to a file, creating it if needed.
    pub fn file(component: &'static str, path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(component, file))
    }

    /// Same sink, different component prefix.
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            component,
            sink: self.sink.clone(),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn line(&self, args: fmt::Arguments<'_>) {
        match &self.sink {
            Sink::Discard => {}
            Sink::Tracing => {
                tracing::debug!(target: "siphon", component = self.component, "{}", args);
            }
            Sink::Writer(writer) => {
                if let Ok(mut guard) = writer.lock() {
                    let _ = writeln!(
                        guard,
                        "[{}] siphon: {}: {}",
                        chrono::Local::now().format("%H:%M:%S%.3f"),
                        self.component,
                        args
                    );
                    let _ = guard.flush();
                }
            }
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.sink {
            Sink::Discard => "discard",
            Sink::Tracing => "tracing",
            Sink::Writer(_) => "writer",
        };
        f.debug_struct("Diagnostics")
            .field("component", &self.component)
            .field("sink", &kind)
            .finish()
    }
}

#[macro_export]
macro_rules! diag {
    ($diag:expr, $($arg:tt)*) => {
        $diag.line(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_writer_sink_prefixes_component() {
        let out = Shared::default();
        let diag = Diagnostics::new("host", out.clone());
        crate::diag!(diag, "accepted {}", 3);
        diag.for_component("client").line(format_args!("dialing"));

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("siphon: host: accepted 3"));
        assert!(lines[1].ends_with("siphon: client: dialing"));
        assert!(lines[0].starts_with('['));
    }

    #[test]
    fn test_discard_sink_is_silent() {
        let diag = Diagnostics::discard("router");
        crate::diag!(diag, "nothing to see");
        assert_eq!(diag.component(), "router");
    }
}
