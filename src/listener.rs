//! Tagged-line listener for the child's stdout stream.
//!
//! A write-only sink installed as one of the stdout tee destinations. It
//! receives an identical copy of the stream in write order, scans for
//! newline-terminated lines carrying [`MSG_PREFIX`](crate::protocol::MSG_PREFIX),
//! and dispatches decoded messages to the readiness gate and variable table.
//! Everything else is discarded without affecting the stream's other
//! consumers.
//!
//! A line that matches the prefix but fails to decode is recorded as a
//! protocol fault rather than failing the write, so ordinary output written
//! before or after the bad line still reaches every destination. The first
//! fault surfaces from `wait` once the process has exited.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::error::HatchError;
use crate::protocol::{self, MSG_PREFIX, Message};
use crate::sync::{ReadyGate, VarTable, lock};

pub(crate) struct MessageListener {
    ready: Arc<ReadyGate>,
    vars: Arc<VarTable>,
    fault: Arc<Mutex<Option<HatchError>>>,
    buf: Vec<u8>,
    // True once the first MSG_PREFIX.len() bytes of the current line have
    // been inspected.
    read_prefix: bool,
    // True when the current line is known not to be a protocol line; bytes
    // are dropped until the next newline.
    skip_line: bool,
}

impl MessageListener {
    pub(crate) fn new(
        ready: Arc<ReadyGate>,
        vars: Arc<VarTable>,
        fault: Arc<Mutex<Option<HatchError>>>,
    ) -> Self {
        Self {
            ready,
            vars,
            fault,
            buf: Vec::new(),
            read_prefix: false,
            skip_line: false,
        }
    }

    fn dispatch(&mut self) {
        match protocol::decode(&self.buf) {
            Ok(Message::Ready) => self.ready.signal(),
            Ok(Message::Vars { vars }) => self.vars.publish(vars),
            Err(e) => {
                // Keep the first violation; later ones add no information.
                let mut fault = lock(&self.fault);
                if fault.is_none() {
                    *fault = Some(e);
                }
            }
        }
    }
}

impl Write for MessageListener {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        for &b in p {
            if b == b'\n' {
                if self.read_prefix && !self.skip_line {
                    self.dispatch();
                }
                self.read_prefix = false;
                self.skip_line = false;
                self.buf.clear();
            } else if !self.skip_line {
                self.buf.push(b);
                if !self.read_prefix && self.buf.len() == MSG_PREFIX.len() {
                    self.read_prefix = true;
                    if self.buf != MSG_PREFIX.as_bytes() {
                        self.skip_line = true;
                    }
                    self.buf.clear();
                }
            }
        }
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Fixture {
        ready: Arc<ReadyGate>,
        vars: Arc<VarTable>,
        fault: Arc<Mutex<Option<HatchError>>>,
        listener: MessageListener,
    }

    fn fixture() -> Fixture {
        let ready = Arc::new(ReadyGate::new());
        let vars = Arc::new(VarTable::new());
        let fault = Arc::new(Mutex::new(None));
        let listener = MessageListener::new(
            Arc::clone(&ready),
            Arc::clone(&vars),
            Arc::clone(&fault),
        );
        Fixture {
            ready,
            vars,
            fault,
            listener,
        }
    }

    fn fault_of(f: &Fixture) -> Option<HatchError> {
        lock(&f.fault).clone()
    }

    #[test]
    fn ready_line_signals_the_gate() {
        let mut f = fixture();
        f.listener
            .write_all(b"#hatch# {\"type\":\"ready\"}\n")
            .unwrap();
        assert!(f.ready.is_set());
        assert!(fault_of(&f).is_none());
    }

    #[test]
    fn vars_line_publishes_to_the_table() {
        let mut f = fixture();
        f.listener
            .write_all(b"#hatch# {\"type\":\"vars\",\"vars\":{\"a\":\"1\"}}\n")
            .unwrap();
        let got = f.vars.await_keys(&["a".to_string()]);
        assert_eq!(got.get("a").map(String::as_str), Some("1"));
    }

    #[test]
    fn ordinary_lines_are_ignored() {
        let mut f = fixture();
        f.listener
            .write_all(b"hello world\nsome other output\n#ha but not quite\n")
            .unwrap();
        assert!(!f.ready.is_set());
        assert!(fault_of(&f).is_none());
    }

    #[test]
    fn short_lines_are_ignored() {
        let mut f = fixture();
        // Shorter than the prefix; never reaches the prefix decision point.
        f.listener.write_all(b"ok\n\n#\n").unwrap();
        assert!(!f.ready.is_set());
        assert!(fault_of(&f).is_none());
    }

    #[test]
    fn messages_split_across_writes_are_reassembled() {
        let mut f = fixture();
        let line = b"#hatch# {\"type\":\"ready\"}\n";
        for chunk in line.chunks(3) {
            f.listener.write_all(chunk).unwrap();
        }
        assert!(f.ready.is_set());
    }

    #[test]
    fn malformed_payload_records_a_protocol_fault() {
        let mut f = fixture();
        f.listener
            .write_all(b"before\n#hatch# {nope\nafter\n")
            .unwrap();
        assert!(matches!(fault_of(&f), Some(HatchError::Protocol(_))));
        // The stream keeps flowing; a later valid message still lands.
        f.listener
            .write_all(b"#hatch# {\"type\":\"ready\"}\n")
            .unwrap();
        assert!(f.ready.is_set());
    }

    #[test]
    fn unknown_discriminant_records_a_protocol_fault() {
        let mut f = fixture();
        f.listener
            .write_all(b"#hatch# {\"type\":\"mystery\"}\n")
            .unwrap();
        assert!(matches!(fault_of(&f), Some(HatchError::Protocol(_))));
    }

    #[test]
    fn first_fault_wins() {
        let mut f = fixture();
        f.listener.write_all(b"#hatch# one\n#hatch# two\n").unwrap();
        let recorded = fault_of(&f).unwrap().to_string();
        assert!(recorded.contains("one"), "recorded: {recorded}");
    }

    #[test]
    fn later_vars_merge_with_earlier_ones() {
        let mut f = fixture();
        f.listener
            .write_all(b"#hatch# {\"type\":\"vars\",\"vars\":{\"a\":\"1\"}}\n")
            .unwrap();
        f.listener
            .write_all(b"#hatch# {\"type\":\"vars\",\"vars\":{\"b\":\"2\",\"a\":\"3\"}}\n")
            .unwrap();
        let got = f.vars.await_keys(&["a".to_string(), "b".to_string()]);
        let want: HashMap<String, String> = [("a", "3"), ("b", "2")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(got, want);
    }
}
