//! Per-process passphrase mailbox (§4.9, §5): a single-cell cache for the
//! system-key passphrase during a fleet run. The fleet scheduler consults
//! it before every task and populates it exactly once, after the operator
//! answers a single prompt; `get` always hands back a defensive copy so no
//! caller can observe (or corrupt) the cell's own backing memory.
//!
//! This is the one piece of process-wide mutable state the design notes
//! (§9) call out as legitimate: it models a process-scoped resource, not a
//! package-global service lookup. Orchestrators still take it as an
//! explicit `Arc<PasswordMailbox>` constructor parameter rather than
//! reaching for a default singleton.

use std::sync::Mutex;

use zeroize::Zeroizing;

#[derive(Default)]
pub struct PasswordMailbox {
    inner: Mutex<Option<Zeroizing<String>>>,
}

impl PasswordMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache `passphrase` for the remainder of the run, replacing whatever
    /// was cached before.
    pub fn set(&self, passphrase: String) {
        let mut guard = self.inner.lock().expect("password mailbox mutex poisoned");
        *guard = Some(Zeroizing::new(passphrase));
    }

    /// A defensive copy of the cached passphrase, or `None` if nothing has
    /// been cached yet.
    pub fn get(&self) -> Option<String> {
        let guard = self.inner.lock().expect("password mailbox mutex poisoned");
        guard.as_ref().map(|p| p.as_str().to_string())
    }

    /// Drop the cached passphrase. Called at the end of a fleet run so a
    /// passphrase never outlives the operation it was collected for.
    pub fn clear(&self) {
        let mut guard = self.inner.lock().expect("password mailbox mutex poisoned");
        *guard = None;
    }

    pub fn is_set(&self) -> bool {
        self.inner.lock().expect("password mailbox mutex poisoned").is_some()
    }
}
