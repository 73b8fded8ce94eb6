//! Per-process controller.
//!
//! A [`Cmd`] owns one underlying OS process: its configuration, the
//! start/exit state machine, the background reaper, and the output plumbing
//! that tees the child's streams to every configured destination.
//!
//! # Lifecycle
//!
//! ```text
//! Registry::command() -> configure -> start() -> await_ready()/await_vars()
//!                                             -> wait() | shutdown(sig)
//! ```
//!
//! `start` and `wait` may each be called at most once. Readiness and
//! variable accessors are only valid between them. On a successful start a
//! reaper thread always waits on the OS process and publishes the exit
//! result exactly once, whether or not anyone ever calls `wait`, so child
//! processes are never leaked as zombies.
//!
//! # Errors
//!
//! Every public accessor funnels its error through one handler that records
//! it on the controller (see [`Cmd::last_error`]) and forwards it to the
//! registry's error policy, except process-exit errors on a command
//! configured with `exit_error_is_ok`.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::error::{HatchError, Result};
use crate::listener::MessageListener;
use crate::pipe::{PipeReader, PipeWriter, buffered_pipe};
use crate::registry::Registry;
use crate::router::{self, CaptureBuffer, MultiWriter, ParentStream, Router, Sink};
use crate::sync::{ReadyGate, VarTable, lock};

/// Timestamp used in child log file names, microsecond precision.
const LOG_STAMP_FORMAT: &str = "%Y%m%d.%H%M%S%.6f";

/// Runtime state shared between the controller, its reaper thread, and the
/// registry's teardown path.
pub(crate) struct Shared {
    // Written by the reaper; read by liveness checks from other threads.
    exited: Mutex<bool>,
    pid: OnceLock<u32>,
    closers: Mutex<Vec<PipeWriter>>,
    ready: Arc<ReadyGate>,
    vars: Arc<VarTable>,
    fault: Arc<Mutex<Option<HatchError>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            exited: Mutex::new(false),
            pid: OnceLock::new(),
            closers: Mutex::new(Vec::new()),
            ready: Arc::new(ReadyGate::new()),
            vars: Arc::new(VarTable::new()),
            fault: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }

    /// Spawned and not yet observed to exit.
    pub(crate) fn is_running(&self) -> bool {
        self.pid.get().is_some() && !self.has_exited()
    }

    fn has_exited(&self) -> bool {
        *lock(&self.exited)
    }

    fn mark_exited(&self) {
        *lock(&self.exited) = true;
    }

    /// Close tracked pipe ends, best-effort, exactly once.
    fn close_closers(&self) {
        for closer in lock(&self.closers).drain(..) {
            closer.close();
        }
    }

    fn take_fault(&self) -> Option<HatchError> {
        lock(&self.fault).take()
    }
}

/// Deliver a signal to a process by pid.
pub(crate) fn send_signal(pid: u32, sig: Signal) -> std::result::Result<(), nix::errno::Errno> {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
}

/// Controller for one child process. See the module docs.
///
/// The public configuration fields must not be modified after `start`.
pub struct Cmd {
    /// Path of the executable to run.
    pub path: PathBuf,
    /// Environment for the child. The child receives exactly these vars.
    pub vars: HashMap<String, String>,
    /// Arguments, not including the executable itself.
    pub args: Vec<String>,
    /// Mirror the child's stdout/stderr to the parent's own streams.
    pub propagate_output: bool,
    /// Directory for per-stream log files, if any.
    pub output_dir: Option<PathBuf>,
    /// Tolerate a non-zero or signaled exit: `wait` returns `Ok` and the
    /// exit error is only recorded, not forwarded to the error policy.
    pub exit_error_is_ok: bool,
    /// Literal payload written to the child's stdin. Mutually exclusive
    /// with [`Cmd::stdin_pipe`].
    pub stdin: Option<String>,

    registry: Arc<Registry>,
    shared: Arc<Shared>,
    last_err: Option<HatchError>,
    called_start: bool,
    called_wait: bool,
    // True once the OS process has actually been spawned.
    started: bool,
    wait_tx: SyncSender<Result<()>>,
    wait_rx: Option<Receiver<Result<()>>>,
    stdin_writer: Option<PipeWriter>,
    stdin_reader: Option<PipeReader>,
    stdout_sinks: Vec<Sink>,
    stderr_sinks: Vec<Sink>,
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("called_start", &self.called_start)
            .field("called_wait", &self.called_wait)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Cmd {
    pub(crate) fn new(
        registry: Arc<Registry>,
        path: PathBuf,
        vars: HashMap<String, String>,
        args: Vec<String>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        registry.register(&shared)?;
        let propagate_output = registry.options().propagate_child_output;
        let output_dir = registry.options().child_output_dir.clone();
        let (wait_tx, wait_rx) = sync_channel(1);
        Ok(Self {
            path,
            vars,
            args,
            propagate_output,
            output_dir,
            exit_error_is_ok: false,
            stdin: None,
            registry,
            shared,
            last_err: None,
            called_start: false,
            called_wait: false,
            started: false,
            wait_tx,
            wait_rx: Some(wait_rx),
            stdin_writer: None,
            stdin_reader: None,
            stdout_sinks: Vec::new(),
            stderr_sinks: Vec::new(),
        })
    }

    /// The most recent error recorded by any accessor, if any.
    pub fn last_error(&self) -> Option<&HatchError> {
        self.last_err.as_ref()
    }

    /// New unstarted command with a copy of this command's configuration.
    pub fn try_clone(&mut self) -> Result<Cmd> {
        let res = Cmd::new(
            Arc::clone(&self.registry),
            self.path.clone(),
            self.vars.clone(),
            self.args.clone(),
        )
        .map(|mut copy| {
            copy.propagate_output = self.propagate_output;
            copy.output_dir = self.output_dir.clone();
            copy.exit_error_is_ok = self.exit_error_is_ok;
            copy.stdin = self.stdin.clone();
            copy
        });
        self.seal(res)
    }

    /// Writer for the child's stdin, backed by a buffered pipe.
    ///
    /// Must be called before `start`. Safe to call repeatedly; later calls
    /// return a handle to the pipe created by the first. The pipe is closed
    /// when the process exits.
    pub fn stdin_pipe(&mut self) -> Result<PipeWriter> {
        let res = self.stdin_pipe_inner();
        self.seal(res)
    }

    fn stdin_pipe_inner(&mut self) -> Result<PipeWriter> {
        if self.called_start {
            return Err(HatchError::AlreadyStarted);
        }
        if let Some(writer) = &self.stdin_writer {
            return Ok(writer.clone());
        }
        let (writer, reader) = buffered_pipe();
        // Registered immediately so even a failed start closes it.
        lock(&self.shared.closers).push(writer.clone());
        self.stdin_writer = Some(writer.clone());
        self.stdin_reader = Some(reader);
        Ok(writer)
    }

    /// Reader fed a copy of the child's stdout, backed by a buffered pipe.
    ///
    /// Must be called before `start`. Each call creates a new pipe. Reading
    /// past process exit yields end-of-stream.
    pub fn stdout_pipe(&mut self) -> Result<PipeReader> {
        let res = self.stream_pipe_inner(true);
        self.seal(res)
    }

    /// Reader fed a copy of the child's stderr. See [`Cmd::stdout_pipe`].
    pub fn stderr_pipe(&mut self) -> Result<PipeReader> {
        let res = self.stream_pipe_inner(false);
        self.seal(res)
    }

    fn stream_pipe_inner(&mut self, stdout: bool) -> Result<PipeReader> {
        if self.called_start {
            return Err(HatchError::AlreadyStarted);
        }
        let (writer, reader) = buffered_pipe();
        // Registered immediately so even a failed start closes it and the
        // returned reader observes end-of-stream instead of blocking.
        lock(&self.shared.closers).push(writer.clone());
        let sinks = if stdout {
            &mut self.stdout_sinks
        } else {
            &mut self.stderr_sinks
        };
        sinks.push(Sink::Pipe(writer));
        Ok(reader)
    }

    /// Tee the child's stdout to the given writer. Must be called before
    /// `start`. The writer is flushed and dropped when the stream ends.
    pub fn add_stdout_writer(&mut self, w: impl Write + Send + 'static) -> Result<()> {
        let res = self.add_writer_inner(true, Box::new(w));
        self.seal(res)
    }

    /// Tee the child's stderr to the given writer. See
    /// [`Cmd::add_stdout_writer`].
    pub fn add_stderr_writer(&mut self, w: impl Write + Send + 'static) -> Result<()> {
        let res = self.add_writer_inner(false, Box::new(w));
        self.seal(res)
    }

    fn add_writer_inner(&mut self, stdout: bool, w: Box<dyn Write + Send>) -> Result<()> {
        if self.called_start {
            return Err(HatchError::AlreadyStarted);
        }
        let sinks = if stdout {
            &mut self.stdout_sinks
        } else {
            &mut self.stderr_sinks
        };
        sinks.push(Sink::Writer(w));
        Ok(())
    }

    /// Spawn the OS process and the background reaper.
    pub fn start(&mut self) -> Result<()> {
        let res = self.start_inner();
        if res.is_err() && !self.started {
            // A failed start must still release blocked pipe readers; every
            // pipe writer is registered as a closer at creation time, so
            // this reaches them no matter how early start_inner bailed out.
            self.shared.mark_exited();
            self.shared.close_closers();
        }
        self.seal(res)
    }

    fn start_inner(&mut self) -> Result<()> {
        if self.called_start {
            return Err(HatchError::AlreadyStarted);
        }
        self.called_start = true;
        if self.stdin.is_some() && self.stdin_writer.is_some() {
            return Err(HatchError::StdinConflict);
        }

        // Held across the spawn so a registry-triggered teardown cannot
        // race process creation.
        let registry_guard = self.registry.begin_spawn()?;

        let stamp = chrono::Utc::now().format(LOG_STAMP_FORMAT).to_string();
        let exe_base = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());

        let mut stdout_router = Router::new();
        stdout_router.add_writer(Box::new(MessageListener::new(
            Arc::clone(&self.shared.ready),
            Arc::clone(&self.shared.vars),
            Arc::clone(&self.shared.fault),
        )));
        if self.propagate_output {
            stdout_router.add_writer(Box::new(ParentStream::Stdout));
        }
        if let Some(dir) = &self.output_dir {
            stdout_router.add_writer(Box::new(router::open_log_file(
                dir, &exe_base, &stamp, "stdout",
            )?));
        }
        for sink in self.stdout_sinks.drain(..) {
            stdout_router.add_sink(sink);
        }

        let mut stderr_router = Router::new();
        if self.propagate_output {
            stderr_router.add_writer(Box::new(ParentStream::Stderr));
        }
        if let Some(dir) = &self.output_dir {
            stderr_router.add_writer(Box::new(router::open_log_file(
                dir, &exe_base, &stamp, "stderr",
            )?));
        }
        for sink in self.stderr_sinks.drain(..) {
            stderr_router.add_sink(sink);
        }

        let stdout_writer = stdout_router.into_writer();
        let stderr_writer = stderr_router.into_writer();

        let wants_stdin = self.stdin.is_some() || self.stdin_reader.is_some();
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .env_clear()
            .envs(&self.vars)
            .stdin(if wants_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| HatchError::Spawn {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })?;

        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| HatchError::Io("child stdout handle missing".into()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| HatchError::Io("child stderr handle missing".into()))?;
        let mut child_stdin = child.stdin.take();

        let pid = child.id();
        let _ = self.shared.pid.set(pid);
        self.started = true;
        debug!(pid, path = %self.path.display(), "spawned child");
        drop(registry_guard);

        let stdin_feeder = match (self.stdin.clone(), self.stdin_reader.take()) {
            (Some(payload), _) => child_stdin.take().map(|mut sink| {
                thread::spawn(move || {
                    if let Err(e) = sink.write_all(payload.as_bytes()) {
                        // The child may exit without reading its stdin.
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            warn!(error = %e, "failed to write stdin payload");
                        }
                    }
                })
            }),
            (None, Some(mut reader)) => child_stdin.take().map(|mut sink| {
                thread::spawn(move || {
                    if let Err(e) = io::copy(&mut reader, &mut sink) {
                        if e.kind() != io::ErrorKind::BrokenPipe {
                            warn!(error = %e, "failed to copy stdin pipe");
                        }
                    }
                })
            }),
            (None, None) => None,
        };

        let stdout_copier = spawn_copier(child_stdout, stdout_writer);
        let stderr_copier = spawn_copier(child_stderr, stderr_writer);

        // The reaper decouples reaping from wait: it always runs to
        // completion so the OS process is waited-on exactly once and all
        // destinations are closed, even if wait is never called.
        let shared = Arc::clone(&self.shared);
        let wait_tx = self.wait_tx.clone();
        thread::spawn(move || {
            let mut copy_err: Option<io::Error> = None;
            for copier in [stdout_copier, stderr_copier] {
                match copier.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        copy_err.get_or_insert(e);
                    }
                    Err(_) => {
                        copy_err.get_or_insert(io::Error::other("output copier panicked"));
                    }
                }
            }
            let status = child.wait();
            shared.mark_exited();
            shared.close_closers();
            if let Some(feeder) = stdin_feeder {
                let _ = feeder.join();
            }
            let result = reap_result(status, shared.take_fault(), copy_err);
            match &result {
                Ok(()) => debug!(pid, "child exited cleanly"),
                Err(e) => debug!(pid, error = %e, "child finished with error"),
            }
            let _ = wait_tx.send(result);
        });
        Ok(())
    }

    /// Block until the child has announced readiness over the protocol.
    ///
    /// Must not be called before `start` or after `wait`.
    pub fn await_ready(&mut self) -> Result<()> {
        let res = self.await_ready_inner();
        self.seal(res)
    }

    fn await_ready_inner(&self) -> Result<()> {
        self.check_awaitable()?;
        self.shared.ready.wait();
        Ok(())
    }

    /// Block until the child has published every requested variable, then
    /// return the latest value of each requested key.
    ///
    /// Must not be called before `start` or after `wait`.
    pub fn await_vars(&mut self, keys: &[&str]) -> Result<HashMap<String, String>> {
        let res = self.await_vars_inner(keys);
        self.seal(res)
    }

    fn await_vars_inner(&self, keys: &[&str]) -> Result<HashMap<String, String>> {
        self.check_awaitable()?;
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Ok(self.shared.vars.await_keys(&keys))
    }

    fn check_awaitable(&self) -> Result<()> {
        if !self.started {
            return Err(HatchError::NotStarted);
        }
        if self.called_wait {
            return Err(HatchError::AlreadyWaited);
        }
        Ok(())
    }

    /// Block until the process has exited and return the reaper's result.
    ///
    /// May be called at most once, before or after the actual exit. With
    /// `exit_error_is_ok` set, a process-exit error is recorded on the
    /// command and `Ok` is returned instead.
    pub fn wait(&mut self) -> Result<()> {
        match self.wait_inner() {
            Err(e) if self.tolerates(&e) => {
                self.last_err = Some(e);
                Ok(())
            }
            res => self.seal(res),
        }
    }

    fn wait_inner(&mut self) -> Result<()> {
        if !self.started {
            return Err(HatchError::NotStarted);
        }
        if self.called_wait {
            return Err(HatchError::AlreadyWaited);
        }
        self.called_wait = true;
        match self.wait_rx.take() {
            Some(rx) => rx.recv().unwrap_or_else(|_| {
                Err(HatchError::Io(
                    "reaper disappeared before publishing a result".into(),
                ))
            }),
            None => Err(HatchError::AlreadyWaited),
        }
    }

    /// Send `sig` to the process, then wait for it to exit.
    ///
    /// Succeeds as a no-op if the process has already exited. A process
    /// that disappears between the liveness check and signal delivery is
    /// treated the same as an already-exited one. A process-exit error
    /// from the implied wait is expected here and reported as success.
    pub fn shutdown(&mut self, sig: Signal) -> Result<()> {
        let res = self.shutdown_inner(sig);
        self.seal(res)
    }

    fn shutdown_inner(&mut self, sig: Signal) -> Result<()> {
        if !self.started {
            return Err(HatchError::NotStarted);
        }
        if !self.is_running() {
            return Ok(());
        }
        if let Some(pid) = self.shared.pid() {
            debug!(pid, signal = %sig, "shutting down child");
            match send_signal(pid, sig) {
                Ok(()) => {}
                // Exited between the liveness check and delivery; the
                // reaper's result still needs consuming below.
                Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    return Err(HatchError::Io(format!("failed to signal pid {pid}: {e}")));
                }
            }
        }
        match self.wait_inner() {
            Ok(()) | Err(HatchError::Exit { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `start` followed by `wait`.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        self.wait()
    }

    /// Run the command and return its captured stdout.
    pub fn stdout(&mut self) -> Result<String> {
        if self.called_start {
            return self.seal(Err(HatchError::AlreadyStarted));
        }
        let capture = CaptureBuffer::new();
        self.stdout_sinks.push(Sink::Writer(Box::new(capture.clone())));
        self.run()?;
        Ok(capture.contents())
    }

    /// Run the command and return its captured stdout and stderr.
    pub fn stdout_stderr(&mut self) -> Result<(String, String)> {
        if self.called_start {
            return self.seal(Err(HatchError::AlreadyStarted));
        }
        let out = CaptureBuffer::new();
        let err = CaptureBuffer::new();
        self.stdout_sinks.push(Sink::Writer(Box::new(out.clone())));
        self.stderr_sinks.push(Sink::Writer(Box::new(err.clone())));
        self.run()?;
        Ok((out.contents(), err.contents()))
    }

    /// OS process id. Fails before `start`.
    pub fn pid(&mut self) -> Result<u32> {
        let res = if self.started {
            match self.shared.pid() {
                Some(pid) => Ok(pid),
                None => Err(HatchError::NotStarted),
            }
        } else {
            Err(HatchError::NotStarted)
        };
        self.seal(res)
    }

    /// Started and not yet observed to exit.
    pub fn is_running(&self) -> bool {
        self.started && self.shared.is_running()
    }

    fn tolerates(&self, err: &HatchError) -> bool {
        self.exit_error_is_ok && matches!(err, HatchError::Exit { .. })
    }

    /// Single error funnel: record the outcome on the controller, then
    /// delegate to the registry's policy unless the error is a tolerated
    /// process-exit error.
    fn seal<T>(&mut self, res: Result<T>) -> Result<T> {
        match res {
            Ok(value) => {
                self.last_err = None;
                Ok(value)
            }
            Err(e) => {
                self.last_err = Some(e.clone());
                if !self.tolerates(&e) {
                    self.registry.handle_error(&e);
                }
                Err(e)
            }
        }
    }
}

fn spawn_copier<R>(mut src: R, mut dst: MultiWriter) -> thread::JoinHandle<io::Result<()>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        io::copy(&mut src, &mut dst)?;
        dst.flush()
    })
}

/// Fold the OS exit status, any recorded protocol fault, and any copier
/// error into the single published wait result. An abnormal exit wins;
/// protocol faults outrank destination I/O errors.
fn reap_result(
    status: io::Result<ExitStatus>,
    fault: Option<HatchError>,
    copy_err: Option<io::Error>,
) -> Result<()> {
    let status = status.map_err(|e| HatchError::Io(format!("wait on child failed: {e}")))?;
    if !status.success() {
        return Err(HatchError::Exit { status });
    }
    if let Some(fault) = fault {
        return Err(fault);
    }
    if let Some(e) = copy_err {
        return Err(HatchError::Io(format!("output copy failed: {e}")));
    }
    Ok(())
}
