//! Registry of spawned commands.
//!
//! The registry owns every [`Cmd`] handle created through it, serializes
//! command creation and spawning against its own teardown, and is consulted
//! for error policy on every surfaced error. There is no ambient global
//! state: callers hold an `Arc<Registry>` and pass it around explicitly.
//!
//! # Teardown
//!
//! [`Registry::cleanup`] marks the registry closed (new commands are
//! rejected) and terminates still-running children: SIGTERM first, a
//! bounded poll of each child's exited flag, then SIGKILL escalation for
//! stragglers. Spawns hold the registry lock, so a command can never slip
//! into existence concurrently with teardown.
//!
//! # Error policy
//!
//! Every error surfaced by a command accessor is first recorded on the
//! command, then handed to the registry's [`ErrorPolicy`] unless it is a
//! tolerated process-exit error. The registry decides process-wide
//! fatality; the command never does.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::cmd::{Cmd, Shared, send_signal};
use crate::error::{HatchError, Result};
use crate::lookpath;
use crate::sync::lock;

/// Decides what happens to errors surfaced by command accessors.
pub trait ErrorPolicy: Send + Sync {
    fn on_error(&self, err: &HatchError);
}

/// Abort the run on the first surfaced error. The harness default: a test
/// or tool that lost a child process usually cannot proceed meaningfully.
pub struct AbortPolicy;

impl ErrorPolicy for AbortPolicy {
    fn on_error(&self, err: &HatchError) {
        panic!("hatch: fatal command error: {err}");
    }
}

/// Record surfaced errors and keep going. Callers inspect
/// [`Cmd::last_error`](crate::Cmd::last_error) after each operation.
pub struct RecordPolicy;

impl ErrorPolicy for RecordPolicy {
    fn on_error(&self, err: &HatchError) {
        warn!(error = %err, "command error recorded");
    }
}

/// Defaults inherited by every command created through a registry.
pub struct RegistryOptions {
    /// Mirror child stdout/stderr to the parent's own streams.
    pub propagate_child_output: bool,
    /// Directory for per-stream child log files, if any.
    pub child_output_dir: Option<PathBuf>,
    /// Base environment for children. Defaults to the parent's environment.
    pub base_env: HashMap<String, String>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            propagate_child_output: false,
            child_output_dir: None,
            base_env: std::env::vars().collect(),
        }
    }
}

pub(crate) struct RegistryState {
    pub(crate) cleaned_up: bool,
    procs: Vec<Arc<Shared>>,
}

/// Owner of all spawned commands. See the module docs.
pub struct Registry {
    opts: RegistryOptions,
    policy: Box<dyn ErrorPolicy>,
    state: Mutex<RegistryState>,
}

impl Registry {
    /// Registry with default options and the abort-on-first-error policy.
    pub fn new() -> Arc<Self> {
        Self::with_policy(AbortPolicy, RegistryOptions::default())
    }

    /// Registry with an explicit policy and options.
    pub fn with_policy(policy: impl ErrorPolicy + 'static, opts: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            opts,
            policy: Box::new(policy),
            state: Mutex::new(RegistryState {
                cleaned_up: false,
                procs: Vec::new(),
            }),
        })
    }

    /// Options inherited by new commands.
    pub fn options(&self) -> &RegistryOptions {
        &self.opts
    }

    /// Create a command for `name` with the given arguments.
    ///
    /// Bare names are resolved against PATH. Fails once teardown has begun.
    pub fn command<I, S>(self: &Arc<Self>, name: &str, args: I) -> Result<Cmd>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let res = lookpath::resolve(name).and_then(|path| {
            Cmd::new(
                Arc::clone(self),
                path,
                self.opts.base_env.clone(),
                args.into_iter().map(Into::into).collect(),
            )
        });
        if let Err(e) = &res {
            self.policy.on_error(e);
        }
        res
    }

    /// Create a command from a full command line, split shell-style.
    pub fn command_line(self: &Arc<Self>, line: &str) -> Result<Cmd> {
        let res = shell_words::split(line)
            .map_err(|e| HatchError::CommandLine(format!("{line:?}: {e}")))
            .and_then(|argv| match argv.split_first() {
                Some((name, rest)) => self.command(name, rest.iter().cloned()),
                None => Err(HatchError::CommandLine(format!("{line:?}: empty"))),
            });
        if let Err(e) = &res {
            // command() already reported its own failures; only report the
            // split/empty cases here.
            if matches!(e, HatchError::CommandLine(_)) {
                self.policy.on_error(e);
            }
        }
        res
    }

    /// Whether teardown has begun.
    pub fn is_cleaned_up(&self) -> bool {
        lock(&self.state).cleaned_up
    }

    /// Record a per-command runtime handle; fails after teardown has begun.
    pub(crate) fn register(&self, shared: &Arc<Shared>) -> Result<()> {
        let mut state = lock(&self.state);
        if state.cleaned_up {
            return Err(HatchError::RegistryClosed);
        }
        state.procs.push(Arc::clone(shared));
        Ok(())
    }

    /// Lock held across process creation so spawning cannot race teardown.
    pub(crate) fn begin_spawn(&self) -> Result<MutexGuard<'_, RegistryState>> {
        let state = lock(&self.state);
        if state.cleaned_up {
            return Err(HatchError::RegistryClosed);
        }
        Ok(state)
    }

    /// Invoke the configured error policy.
    pub(crate) fn handle_error(&self, err: &HatchError) {
        self.policy.on_error(err);
    }

    /// Begin teardown and terminate still-running children.
    ///
    /// Idempotent; later calls return immediately. Waiting for exits is
    /// best-effort and bounded; a child that survives SIGKILL delivery is
    /// logged and abandoned.
    pub fn cleanup(&self) {
        let procs: Vec<Arc<Shared>> = {
            let mut state = lock(&self.state);
            if state.cleaned_up {
                return;
            }
            state.cleaned_up = true;
            state.procs.clone()
        };

        let running: Vec<Arc<Shared>> = procs.into_iter().filter(|p| p.is_running()).collect();
        if running.is_empty() {
            return;
        }
        debug!(count = running.len(), "terminating running commands");

        signal_all(&running, Signal::SIGTERM);
        if poll_exited(&running, Duration::from_millis(500)) {
            return;
        }
        signal_all(&running, Signal::SIGKILL);
        if !poll_exited(&running, Duration::from_secs(2)) {
            warn!("some commands did not exit after SIGKILL");
        }
    }
}

fn signal_all(procs: &[Arc<Shared>], sig: Signal) {
    for p in procs {
        if !p.is_running() {
            continue;
        }
        if let Some(pid) = p.pid() {
            debug!(pid, signal = %sig, "signaling child");
            // ESRCH just means it exited between the check and delivery.
            if let Err(e) = send_signal(pid, sig) {
                if e != nix::errno::Errno::ESRCH {
                    warn!(pid, error = %e, "failed to signal child");
                }
            }
        }
    }
}

/// Poll until every handle reports exited or the deadline passes.
fn poll_exited(procs: &[Arc<Shared>], deadline: Duration) -> bool {
    let start = Instant::now();
    loop {
        if procs.iter().all(|p| !p.is_running()) {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
