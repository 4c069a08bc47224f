use std::collections::HashSet;

use parking_lot::Mutex;

/// Set of keys currently being worked on. Used so that only one listener thread completes the
/// first handshake for a given address.
#[derive(Default)]
pub struct ExecGuard {
    keys: Mutex<HashSet<u64>>,
}

/// Holds a key of an [`ExecGuard`]; the key is released on drop.
pub struct Entered<'a> {
    guard: &'a ExecGuard,
    key: u64,
}

impl ExecGuard {
    pub fn new() -> Self {
        Default::default()
    }

    /// Claims `key`. Returns `None` if another thread holds it.
    pub fn try_enter(&self, key: u64) -> Option<Entered<'_>> {
        if self.keys.lock().insert(key) {
            Some(Entered { guard: self, key })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn is_held(&self, key: u64) -> bool {
        self.keys.lock().contains(&key)
    }
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        self.guard.keys.lock().remove(&self.key);
    }
}
