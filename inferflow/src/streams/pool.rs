//! Fixed-size pool of inference stream slots.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Identifier of one execution stream within a model's pool.
pub type StreamId = usize;

/// A bounded pool of reusable stream slot ids for one compiled model.
///
/// Slots are kept in a circular buffer of monotonically advancing positions.
/// Acquisition takes from the front under a mutex and waits on a condition
/// variable while the ring is empty. Release reserves a ring position with a
/// `fetch_add`, writes the slot, and publishes it with a CAS bump, so
/// concurrent releases never block each other or an acquirer.
///
/// The idle and in-use slot ids partition `[0, size)` at all times; a slot id
/// is handed to at most one concurrent acquirer.
#[derive(Debug)]
pub struct StreamPool {
    ring: Box<[AtomicUsize]>,
    front: Mutex<u64>,
    available: Condvar,
    reserved: AtomicU64,
    published: AtomicU64,
    size: usize,
    active_guards: AtomicUsize,
    in_flight: AtomicUsize,
}

impl StreamPool {
    /// Creates a pool holding slot ids `0..size`.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero; a model with no streams is a programmer
    /// error, not a runtime condition.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "stream pool must hold at least one slot");
        let ring: Box<[AtomicUsize]> = (0..size).map(AtomicUsize::new).collect();
        Self {
            ring,
            front: Mutex::new(0),
            available: Condvar::new(),
            reserved: AtomicU64::new(size as u64),
            published: AtomicU64::new(size as u64),
            size,
            active_guards: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Number of slots the pool was created with.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of currently idle slots.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        let front = self.front.lock();
        usize::try_from(self.published.load(Ordering::Acquire) - *front).unwrap_or(0)
    }

    /// Number of guards currently constructed against this pool.
    #[must_use]
    pub fn active_guards(&self) -> usize {
        self.active_guards.load(Ordering::Relaxed)
    }

    /// Number of slots currently resolved to a guard and not yet returned.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Takes an idle slot, waiting up to `timeout` for one to be released.
    ///
    /// Returns `None` when no slot became idle within the timeout.
    pub fn try_acquire(&self, timeout: Duration) -> Option<StreamId> {
        let deadline = Instant::now() + timeout;
        let mut front = self.front.lock();
        while *front == self.published.load(Ordering::Acquire) {
            if self.available.wait_until(&mut front, deadline).timed_out()
                && *front == self.published.load(Ordering::Acquire)
            {
                return None;
            }
        }
        let position = *front;
        *front += 1;
        Some(self.ring[(position % self.size as u64) as usize].load(Ordering::Acquire))
    }

    /// Takes an idle slot, blocking until one is available.
    ///
    /// The pool layer has no timeout; callers needing a bounded wait use
    /// [`try_acquire`](Self::try_acquire).
    pub fn acquire(&self) -> StreamId {
        let mut front = self.front.lock();
        while *front == self.published.load(Ordering::Acquire) {
            self.available.wait(&mut front);
        }
        let position = *front;
        *front += 1;
        self.ring[(position % self.size as u64) as usize].load(Ordering::Acquire)
    }

    /// Returns a slot to the pool and wakes one waiting acquirer.
    ///
    /// Never blocks.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside `[0, size)`; returning a foreign slot would
    /// break the idle/in-use partition invariant.
    pub fn release(&self, id: StreamId) {
        assert!(id < self.size, "released slot id outside the pool");
        let position = self.reserved.fetch_add(1, Ordering::Relaxed);
        self.ring[(position % self.size as u64) as usize].store(id, Ordering::Release);
        // Publish strictly in reservation order so acquirers never observe a
        // position whose slot has not been written yet.
        while self
            .published
            .compare_exchange(position, position + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.available.notify_one();
    }

    pub(crate) fn guard_constructed(&self) {
        self.active_guards.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn guard_dropped(&self) {
        self.active_guards.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn slot_resolved(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn slot_returned(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_hands_out_distinct_slots() {
        let pool = StreamPool::new(3);
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(pool.try_acquire(Duration::from_millis(10)).unwrap());
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_extra_acquirer_times_out_until_release() {
        let pool = StreamPool::new(1);
        let held = pool.try_acquire(Duration::from_millis(10)).unwrap();
        assert!(pool.try_acquire(Duration::from_millis(5)).is_none());
        pool.release(held);
        assert_eq!(pool.try_acquire(Duration::from_millis(10)), Some(held));
    }

    #[test]
    fn test_blocked_acquirer_woken_by_release() {
        let pool = Arc::new(StreamPool::new(1));
        let held = pool.acquire();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        pool.release(held);
        let reacquired = waiter.join().unwrap();
        assert_eq!(reacquired, held);
    }

    #[test]
    fn test_concurrent_churn_preserves_partition() {
        let pool = Arc::new(StreamPool::new(4));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let id = pool.acquire();
                    assert!(id < 4);
                    pool.release(id);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.idle_count(), 4);

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(pool.acquire());
        }
        assert_eq!(seen, (0..4).collect::<HashSet<_>>());
    }

    #[test]
    #[should_panic(expected = "released slot id outside the pool")]
    fn test_release_of_foreign_slot_panics() {
        let pool = StreamPool::new(2);
        pool.release(7);
    }
}
