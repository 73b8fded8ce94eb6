//! Error types for the hatch harness.
//!
//! Uses thiserror for derive macros. Variants carry formatted strings or
//! simple copyable data so errors can be cloned into a controller's
//! recorded-error slot and inspected after the fact.

use std::process::ExitStatus;
use thiserror::Error;

/// Main error type for hatch operations.
///
/// The taxonomy separates usage-sequencing errors (an operation called out
/// of order), spawn failures, process-exit errors, wire-protocol violations,
/// and plain I/O failures from output destinations.
#[derive(Error, Debug, Clone)]
pub enum HatchError {
    /// `start` was called more than once, or a pre-start operation was
    /// attempted after `start`.
    #[error("command already started")]
    AlreadyStarted,

    /// `wait` was called more than once, or a between-start-and-wait
    /// operation was attempted after `wait`.
    #[error("command already waited")]
    AlreadyWaited,

    /// An operation requiring a started command was called before `start`.
    #[error("command not started")]
    NotStarted,

    /// The registry has begun teardown; no new commands may be created or
    /// started.
    #[error("registry already cleaned up")]
    RegistryClosed,

    /// A literal stdin payload and a stdin pipe were both configured.
    #[error("cannot both set a stdin payload and open a stdin pipe")]
    StdinConflict,

    /// The executable name could not be resolved against PATH.
    #[error("executable '{0}' not found in PATH")]
    NotFound(String),

    /// The OS-level spawn itself failed.
    #[error("failed to spawn '{path}': {detail}")]
    Spawn { path: String, detail: String },

    /// The process terminated with a non-zero status or via a signal.
    ///
    /// Reported through the registry's error policy unless the command was
    /// configured with `exit_error_is_ok`.
    #[error("command exited with {status}")]
    Exit { status: ExitStatus },

    /// A line carried the message prefix but its payload failed to decode.
    /// This is a contract violation by the child, distinct from ordinary
    /// unrelated output on the same stream.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A full command line could not be split into an argument vector.
    #[error("invalid command line: {0}")]
    CommandLine(String),

    /// I/O failure from an output destination or the OS wait call.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for hatch operations.
pub type Result<T> = std::result::Result<T, HatchError>;
