//! RAII acquisition of a stream slot.

use super::pool::{StreamId, StreamPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A pending acquisition of one slot from a [`StreamPool`].
///
/// The guard supports optimistic probing (`try_get_id`) and early disarm
/// (`try_disarm`) for branches that become moot before they run. Dropping a
/// guard that was neither resolved nor disarmed blocks until the acquisition
/// resolves and then returns the slot, so a slot can never leak even when a
/// node is torn down mid-acquisition.
#[derive(Debug)]
pub struct StreamGuard {
    pool: Arc<StreamPool>,
    resolved: Option<StreamId>,
    disarmed: bool,
}

impl StreamGuard {
    /// Starts an acquisition against `pool`.
    #[must_use]
    pub fn new(pool: Arc<StreamPool>) -> Self {
        pool.guard_constructed();
        Self {
            pool,
            resolved: None,
            disarmed: false,
        }
    }

    /// Probes for the acquired slot id, waiting at most `timeout`.
    ///
    /// Returns `None` while no slot has become idle yet; the caller is
    /// expected to retry (the orchestrator defers the session instead of
    /// blocking on the pool).
    pub fn try_get_id(&mut self, timeout: Duration) -> Option<StreamId> {
        if self.disarmed {
            return None;
        }
        if let Some(id) = self.resolved {
            return Some(id);
        }
        let id = self.pool.try_acquire(timeout)?;
        self.pool.slot_resolved();
        self.resolved = Some(id);
        Some(id)
    }

    /// Attempts to cancel the acquisition, returning the slot immediately if
    /// it resolved within `timeout`.
    ///
    /// Returns `true` once the guard is disarmed; a disarmed guard skips
    /// execution entirely and its drop is a no-op.
    pub fn try_disarm(&mut self, timeout: Duration) -> bool {
        if self.disarmed {
            return true;
        }
        match self.try_get_id(timeout) {
            Some(id) => {
                self.return_slot(id);
                self.disarmed = true;
                debug!(slot = id, "stream guard disarmed");
                true
            }
            None => false,
        }
    }

    /// Whether the guard has been disarmed.
    #[must_use]
    pub fn is_disarmed(&self) -> bool {
        self.disarmed
    }

    fn return_slot(&mut self, id: StreamId) {
        self.resolved = None;
        self.pool.release(id);
        self.pool.slot_returned();
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.disarmed {
            match self.resolved.take() {
                Some(id) => {
                    self.pool.release(id);
                    self.pool.slot_returned();
                }
                None => {
                    // The acquisition is still pending; wait it out and hand
                    // the slot straight back so the pool stays whole.
                    let id = self.pool.acquire();
                    self.pool.release(id);
                }
            }
        }
        self.pool.guard_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const PROBE: Duration = Duration::from_millis(5);

    #[test]
    fn test_resolves_to_idle_slot() {
        let pool = Arc::new(StreamPool::new(2));
        let mut guard = StreamGuard::new(Arc::clone(&pool));
        let id = guard.try_get_id(PROBE).unwrap();
        assert!(id < 2);
        assert_eq!(pool.in_flight(), 1);
        drop(guard);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.active_guards(), 0);
    }

    #[test]
    fn test_probe_fails_on_exhausted_pool() {
        let pool = Arc::new(StreamPool::new(1));
        let mut first = StreamGuard::new(Arc::clone(&pool));
        assert!(first.try_get_id(PROBE).is_some());

        let mut second = StreamGuard::new(Arc::clone(&pool));
        assert!(second.try_get_id(Duration::from_millis(1)).is_none());

        drop(first);
        assert!(second.try_get_id(PROBE).is_some());
    }

    #[test]
    fn test_disarm_returns_slot_without_execution() {
        let pool = Arc::new(StreamPool::new(1));
        let mut guard = StreamGuard::new(Arc::clone(&pool));
        assert!(guard.try_get_id(PROBE).is_some());
        assert!(guard.try_disarm(PROBE));
        assert!(guard.is_disarmed());
        assert_eq!(pool.idle_count(), 1);
        drop(guard);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_disarm_fails_while_pool_exhausted() {
        let pool = Arc::new(StreamPool::new(1));
        let mut holder = StreamGuard::new(Arc::clone(&pool));
        assert!(holder.try_get_id(PROBE).is_some());

        let mut moot = StreamGuard::new(Arc::clone(&pool));
        assert!(!moot.try_disarm(Duration::from_millis(1)));
        drop(holder);
        assert!(moot.try_disarm(PROBE));
    }

    #[test]
    fn test_unresolved_drop_waits_then_restores_pool() {
        let pool = Arc::new(StreamPool::new(1));
        let mut holder = StreamGuard::new(Arc::clone(&pool));
        holder.try_get_id(PROBE).unwrap();

        let dropper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let pending = StreamGuard::new(pool);
                // Never resolved, never disarmed: drop must wait for a slot
                // and give it back.
                drop(pending);
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(holder);
        dropper.join().unwrap();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_guards(), 0);
    }

    #[test]
    fn test_no_leak_under_mixed_guard_lifecycles() {
        let pool = Arc::new(StreamPool::new(3));
        for round in 0..20 {
            let mut a = StreamGuard::new(Arc::clone(&pool));
            let mut b = StreamGuard::new(Arc::clone(&pool));
            let c = StreamGuard::new(Arc::clone(&pool));
            a.try_get_id(PROBE);
            if round % 2 == 0 {
                b.try_disarm(PROBE);
            }
            drop(c);
            drop(b);
            drop(a);
        }
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.active_guards(), 0);
    }
}
