//! Readiness and published-variable synchronization.
//!
//! Two independent wait conditions updated by the stdout message listener
//! and observed by blocking accessors on the command:
//!
//! - [`ReadyGate`]: a one-way "child is ready" flag.
//! - [`VarTable`]: an accumulating key/value map where later publications
//!   of the same key overwrite earlier ones.
//!
//! Both use a mutex/condvar pair with a predicate re-check loop, so spurious
//! wakeups and lost-wakeup races are handled. Neither applies a timeout;
//! unbounded blocking is the contract, bounded only by the caller.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// One-shot readiness flag with blocking waiters.
pub(crate) struct ReadyGate {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl ReadyGate {
    pub(crate) fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Set the flag and wake all waiters. Idempotent.
    pub(crate) fn signal(&self) {
        let mut flag = lock(&self.flag);
        *flag = true;
        self.cond.notify_all();
    }

    /// Block until the flag has been set.
    pub(crate) fn wait(&self) {
        let mut flag = lock(&self.flag);
        while !*flag {
            flag = self.cond.wait(flag).unwrap_or_else(|e| e.into_inner());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        *lock(&self.flag)
    }
}

/// Accumulated variables published by the child, with blocking key waiters.
pub(crate) struct VarTable {
    vars: Mutex<HashMap<String, String>>,
    cond: Condvar,
}

impl VarTable {
    pub(crate) fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Merge a publication into the table (last write wins) and wake all
    /// waiters.
    pub(crate) fn publish(&self, updates: HashMap<String, String>) {
        let mut vars = lock(&self.vars);
        vars.extend(updates);
        self.cond.notify_all();
    }

    /// Block until every requested key is present, then return the latest
    /// value of each requested key and nothing else.
    pub(crate) fn await_keys(&self, keys: &[String]) -> HashMap<String, String> {
        let want: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
        let mut vars = lock(&self.vars);
        loop {
            let got: HashMap<String, String> = want
                .iter()
                .filter_map(|k| vars.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect();
            if got.len() == want.len() {
                return got;
            }
            vars = self.cond.wait(vars).unwrap_or_else(|e| e.into_inner());
        }
    }
}
