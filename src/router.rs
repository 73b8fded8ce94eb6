//! Per-stream output fan-out.
//!
//! Each of the child's stdout/stderr streams is routed to an ordered list
//! of destinations assembled at start time: the message listener (stdout
//! only), pass-through to the parent's own standard streams, an exclusively
//! created log file under the configured output directory, and any writers,
//! pull pipes, or capture buffers registered before start. Every write goes
//! to every destination; a failure writing to any one destination fails
//! that write.
//!
//! Pipe writer ends are registered with the controller as closers when the
//! pipe is created, so the process-exit path (and a failed start) can close
//! them exactly once and pipe readers observe end-of-stream. The parent's
//! own stdout/stderr are represented as pass-through handles that are never
//! closed, so sibling commands sharing them keep working.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{HatchError, Result};
use crate::pipe::PipeWriter;
use crate::sync::lock;

/// A destination registered before start.
pub(crate) enum Sink {
    /// Writer end of a caller-requested pull pipe; closed at process exit.
    Pipe(PipeWriter),
    /// Caller-supplied writer; flushed and dropped when the stream ends.
    Writer(Box<dyn Write + Send>),
}

/// Pass-through to the parent process's own standard streams.
pub(crate) enum ParentStream {
    Stdout,
    Stderr,
}

impl Write for ParentStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ParentStream::Stdout => io::stdout().lock().write(buf),
            ParentStream::Stderr => io::stderr().lock().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ParentStream::Stdout => io::stdout().lock().flush(),
            ParentStream::Stderr => io::stderr().lock().flush(),
        }
    }
}

/// In-memory capture buffer used by the stdout/stderr convenience accessors.
#[derive(Clone, Default)]
pub(crate) struct CaptureBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Captured bytes as a string, invalid UTF-8 replaced.
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.inner)).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.inner).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Ordered destination list for one process stream, under assembly.
pub(crate) struct Router {
    writers: Vec<Box<dyn Write + Send>>,
}

impl Router {
    pub(crate) fn new() -> Self {
        Self {
            writers: Vec::new(),
        }
    }

    pub(crate) fn add_writer(&mut self, w: Box<dyn Write + Send>) {
        self.writers.push(w);
    }

    pub(crate) fn add_sink(&mut self, sink: Sink) {
        match sink {
            Sink::Pipe(w) => self.writers.push(Box::new(w)),
            Sink::Writer(w) => self.writers.push(w),
        }
    }

    /// Finish assembly into the combined writer fed by the stream copier.
    pub(crate) fn into_writer(self) -> MultiWriter {
        MultiWriter::new(self.writers)
    }
}

/// Combined sink: every write goes to every destination in order.
pub(crate) struct MultiWriter {
    writers: Vec<Box<dyn Write + Send>>,
}

impl MultiWriter {
    pub(crate) fn new(writers: Vec<Box<dyn Write + Send>>) -> Self {
        Self { writers }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in &mut self.writers {
            w.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            w.flush()?;
        }
        Ok(())
    }
}

/// Open a per-stream log file under the output directory.
///
/// The name is deterministic from the executable's base name, the start
/// timestamp, and the stream name. Created exclusively: an existing file of
/// the same name is a loud error, never a silent overwrite.
pub(crate) fn open_log_file(
    dir: &Path,
    exe_base: &str,
    stamp: &str,
    stream: &str,
) -> Result<File> {
    let name: PathBuf = dir.join(format!("{}.{}.{}", exe_base, stamp, stream));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&name)
        .map_err(|e| {
            HatchError::Io(format!(
                "failed to create log file '{}': {}",
                name.display(),
                e
            ))
        })
}
