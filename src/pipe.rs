//! Buffered in-memory byte pipe.
//!
//! A concurrency-safe, unbounded pipe with a writer end and a reader end.
//! Writes never block on a slow reader; reads block until data arrives or
//! the pipe is closed. Used for pull-style stdout/stderr consumption and
//! for feeding a child's stdin from the caller's thread.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::sync::lock;

struct PipeState {
    buf: VecDeque<u8>,
    closed: bool,
}

struct PipeInner {
    state: Mutex<PipeState>,
    readable: Condvar,
}

/// Create a connected writer/reader pair.
pub fn buffered_pipe() -> (PipeWriter, PipeReader) {
    let inner = Arc::new(PipeInner {
        state: Mutex::new(PipeState {
            buf: VecDeque::new(),
            closed: false,
        }),
        readable: Condvar::new(),
    });
    (
        PipeWriter {
            inner: Arc::clone(&inner),
        },
        PipeReader { inner },
    )
}

/// Writer end of a buffered pipe.
///
/// Cloneable; all clones feed the same buffer. Closing any clone closes the
/// pipe for every handle.
#[derive(Clone)]
pub struct PipeWriter {
    inner: Arc<PipeInner>,
}

impl PipeWriter {
    /// Close the pipe. Blocked readers wake up and observe end-of-stream
    /// once the buffer is drained. Idempotent.
    pub fn close(&self) {
        let mut state = lock(&self.inner.state);
        state.closed = true;
        self.inner.readable.notify_all();
    }

    /// Whether the pipe has been closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write to closed pipe",
            ));
        }
        state.buf.extend(buf);
        self.inner.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reader end of a buffered pipe.
pub struct PipeReader {
    inner: Arc<PipeInner>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = lock(&self.inner.state);
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for slot in buf.iter_mut().take(n) {
                    // Guarded by the length check above.
                    if let Some(b) = state.buf.pop_front() {
                        *slot = b;
                    }
                }
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            state = self
                .inner
                .readable
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn write_then_read_round_trips() {
        let (mut w, mut r) = buffered_pipe();
        w.write_all(b"hello pipe").unwrap();
        w.close();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello pipe");
    }

    #[test]
    fn writes_never_block_without_a_reader() {
        let (mut w, _r) = buffered_pipe();
        // A megabyte with nobody reading; must return immediately.
        let chunk = vec![b'x'; 1024];
        for _ in 0..1024 {
            w.write_all(&chunk).unwrap();
        }
    }

    #[test]
    fn read_blocks_until_data_arrives() {
        let (mut w, mut r) = buffered_pipe();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4];
            let n = r.read(&mut buf).unwrap();
            (n, buf)
        });
        thread::sleep(Duration::from_millis(50));
        w.write_all(b"ping").unwrap();
        let (n, buf) = handle.join().unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn close_drains_then_eofs() {
        let (mut w, mut r) = buffered_pipe();
        w.write_all(b"tail").unwrap();
        w.close();
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tail");
        // Subsequent reads keep returning EOF.
        let mut buf = [0u8; 1];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_after_close_fails() {
        let (mut w, _r) = buffered_pipe();
        w.close();
        let err = w.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn close_through_any_clone_wakes_reader() {
        let (w, mut r) = buffered_pipe();
        let w2 = w.clone();
        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            r.read_to_end(&mut out).unwrap();
            out
        });
        thread::sleep(Duration::from_millis(50));
        w2.close();
        assert!(handle.join().unwrap().is_empty());
        assert!(w.is_closed());
    }
}
