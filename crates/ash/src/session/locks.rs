//! Per-session lock map.
//!
//! Every lifecycle op and every message send serializes on the session's
//! mutex. Locks may be held across I/O; the map itself is only touched in
//! short critical sections (dashmap shards). Idle entries are expired to
//! bound memory.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const EXPIRY_SCAN_THRESHOLD: usize = 1024;
const IDLE_EXPIRY: Duration = Duration::from_secs(10 * 60);

struct LockEntry {
    lock: Arc<Mutex<()>>,
    last_used: Instant,
}

/// Keyed lock map with idle expiry.
#[derive(Default)]
pub struct SessionLocks {
    entries: DashMap<String, LockEntry>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one session id, creating it on first use.
    pub fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        if self.entries.len() > EXPIRY_SCAN_THRESHOLD {
            self.expire_idle();
        }

        let mut entry = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| LockEntry {
                lock: Arc::new(Mutex::new(())),
                last_used: Instant::now(),
            });
        entry.last_used = Instant::now();
        entry.lock.clone()
    }

    /// Drop idle, uncontended entries.
    fn expire_idle(&self) {
        self.entries.retain(|_, entry| {
            entry.last_used.elapsed() < IDLE_EXPIRY || Arc::strong_count(&entry.lock) > 1
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_session_same_lock() {
        let locks = SessionLocks::new();
        let a = locks.lock_for("s1");
        let b = locks.lock_for("s1");
        assert!(Arc::ptr_eq(&a, &b));

        let other = locks.lock_for("s2");
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_serializes_holders() {
        let locks = SessionLocks::new();
        let lock = locks.lock_for("s1");

        let guard = lock.lock().await;
        let contender = locks.lock_for("s1");
        assert!(contender.try_lock().is_err());
        drop(guard);
        assert!(contender.try_lock().is_ok());
    }
}
