//! Wire protocol between a child process and its parent harness.
//!
//! A child talks back to the parent by writing tagged lines to its own
//! stdout, interleaved with whatever else it prints. Each message occupies
//! one newline-terminated line beginning with [`MSG_PREFIX`], followed by a
//! JSON object with a `type` discriminant:
//!
//! ```text
//! #hatch# {"type":"ready"}
//! #hatch# {"type":"vars","vars":{"port":"8080"}}
//! ```
//!
//! Lines without the prefix carry no special meaning. A line that matches
//! the prefix but fails to decode is a protocol violation.

use std::collections::HashMap;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::{HatchError, Result};

/// Literal prefix marking a protocol line on the child's stdout.
pub const MSG_PREFIX: &str = "#hatch# ";

/// A decoded protocol message.
///
/// Unknown discriminants are a decode error, not a new variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// The child announces it has finished initializing.
    Ready,
    /// The child publishes key/value variables to the parent.
    Vars { vars: HashMap<String, String> },
}

/// Decode the payload that followed a matching prefix.
pub(crate) fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(|e| {
        HatchError::Protocol(format!(
            "undecodable message {:?}: {}",
            String::from_utf8_lossy(payload),
            e
        ))
    })
}

/// Encode a message as a full protocol line, trailing newline included.
pub(crate) fn encode(msg: &Message) -> Result<String> {
    let payload = serde_json::to_string(msg)
        .map_err(|e| HatchError::Protocol(format!("failed to encode message: {}", e)))?;
    Ok(format!("{}{}\n", MSG_PREFIX, payload))
}

/// Announce readiness to the parent harness.
///
/// Called from inside a child process; writes one protocol line to the
/// calling process's own stdout and flushes it.
pub fn send_ready() -> Result<()> {
    emit(&Message::Ready)
}

/// Publish variables to the parent harness.
///
/// Keys sent more than once overwrite earlier values on the parent side.
pub fn send_vars(vars: &HashMap<String, String>) -> Result<()> {
    emit(&Message::Vars { vars: vars.clone() })
}

fn emit(msg: &Message) -> Result<()> {
    let line = encode(msg)?;
    let mut out = io::stdout().lock();
    out.write_all(line.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| HatchError::Io(format!("failed to write protocol message: {}", e)))
}
