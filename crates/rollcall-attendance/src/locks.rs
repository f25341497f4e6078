//! Per-identity mutual exclusion.
//!
//! Check-in, checkout and the sweep all read-then-write one identity's
//! session state. Holding that identity's lock across the read and the write
//! keeps them from interleaving while leaving other identities unblocked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct IdentityLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `identity_id`.
    pub fn with<T>(&self, identity_id: &str, f: impl FnOnce() -> T) -> T {
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(table.entry(identity_id.to_string()).or_default())
        };

        let result = {
            let _guard = entry.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };

        // Drop the entry once nobody else holds or waits on it. Clones are
        // only taken under the table lock, so the count cannot race upward.
        let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
        if Arc::strong_count(&entry) == 2 {
            table.remove(identity_id);
        }
        result
    }

    /// Identities with a lock currently held or awaited.
    pub fn in_use(&self) -> usize {
        self.table.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_same_identity_is_serialized() {
        let locks = IdentityLocks::new();
        let inside = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    locks.with("S1", || {
                        let n = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(n, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.in_use(), 0);
    }

    #[test]
    fn test_returns_closure_value() {
        let locks = IdentityLocks::new();
        assert_eq!(locks.with("S1", || 7), 7);
        assert_eq!(locks.in_use(), 0);
    }

    #[test]
    fn test_distinct_identities_do_not_block() {
        let locks = IdentityLocks::new();
        locks.with("S1", || {
            // Would deadlock if S2 shared S1's mutex.
            locks.with("S2", || {});
        });
    }
}
