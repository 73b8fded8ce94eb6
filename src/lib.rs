//! hatch: a child-process harness.
//!
//! hatch spawns and supervises child processes for tests and tools that
//! orchestrate real executables: it multiplexes each child's output to any
//! number of destinations, lets the child report readiness and key/value
//! variables back over its own stdout, and guarantees every spawned process
//! is reaped exactly once.
//!
//! # Usage
//!
//! Create a [`Registry`], ask it for commands, and drive each [`Cmd`]
//! through its lifecycle:
//!
//! ```no_run
//! use hatch::{Registry, Signal};
//!
//! let reg = Registry::new();
//! let mut server = reg.command("my-server", ["--port", "0"]).unwrap();
//! server.start().unwrap();
//!
//! // Block until the server prints its port over the wire protocol.
//! let vars = server.await_vars(&["port"]).unwrap();
//! println!("server is listening on {}", vars["port"]);
//!
//! server.shutdown(Signal::SIGTERM).unwrap();
//! reg.cleanup();
//! ```
//!
//! Child processes written in Rust announce readiness and variables with
//! [`send_ready`] and [`send_vars`]; children in any language can emit the
//! same prefixed JSON lines by hand (see [`protocol`]).
//!
//! # Error handling
//!
//! Errors surface as [`HatchError`] through explicit [`Result`] returns and
//! are additionally routed through the registry's [`ErrorPolicy`]. The
//! default [`AbortPolicy`] treats any command error as fatal to the run;
//! [`RecordPolicy`] logs and keeps going.

mod cmd;
mod error;
mod listener;
mod lookpath;
mod pipe;
pub mod protocol;
mod registry;
mod router;
mod sync;

pub use cmd::Cmd;
pub use error::{HatchError, Result};
pub use pipe::{PipeReader, PipeWriter, buffered_pipe};
pub use protocol::{MSG_PREFIX, Message, send_ready, send_vars};
pub use registry::{AbortPolicy, ErrorPolicy, RecordPolicy, Registry, RegistryOptions};

/// Signals deliverable via [`Cmd::shutdown`] and registry teardown.
pub use nix::sys::signal::Signal;
