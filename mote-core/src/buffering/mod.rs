//! Bounded circular sample store shared between the session (producer) and
//! the playback scheduler (consumer).
//!
//! The slots and both cursors live behind a `parking_lot::Mutex` that is held
//! only for the O(chunk) copy. Every lock attempt is bounded by `lock_wait`;
//! a timed-out attempt returns `None` and the caller skips that cycle.
//!
//! The cursors are mirrored into atomics after each mutation so either side
//! can read an approximate occupancy without taking the lock. Exact
//! accounting is recomputed under the lock before any mutation.
//!
//! One slot is always left unused so that `write == read` means empty.

pub mod chunk;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Smallest usable ring: one data slot plus the reserved slot.
pub const MIN_CAPACITY: usize = 2;

struct Slots {
    data: Box<[i16]>,
    write: usize,
    read: usize,
}

impl Slots {
    fn occupied(&self) -> usize {
        let cap = self.data.len();
        (self.write + cap - self.read) % cap
    }
}

/// Fixed-capacity single-producer/single-consumer sample ring.
pub struct SampleRing {
    slots: Mutex<Slots>,
    write_hint: AtomicUsize,
    read_hint: AtomicUsize,
    capacity: usize,
    lock_wait: Duration,
}

impl SampleRing {
    /// Allocate a zero-filled ring with `capacity` slots (usable: `capacity - 1`).
    pub fn new(capacity: usize, lock_wait: Duration) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            slots: Mutex::new(Slots {
                data: vec![0i16; capacity].into_boxed_slice(),
                write: 0,
                read: 0,
            }),
            write_hint: AtomicUsize::new(0),
            read_hint: AtomicUsize::new(0),
            capacity,
            lock_wait,
        }
    }

    /// Ring sized for `seconds` of audio at `sample_rate`.
    pub fn with_duration(sample_rate: u32, seconds: u32, lock_wait: Duration) -> Self {
        let capacity = (sample_rate as usize).saturating_mul(seconds as usize) + 1;
        Self::new(capacity, lock_wait)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Occupancy from the lock-free cursor mirrors. May lag a concurrent writer.
    pub fn approx_occupied(&self) -> usize {
        let write = self.write_hint.load(Ordering::Acquire);
        let read = self.read_hint.load(Ordering::Acquire);
        (write + self.capacity - read) % self.capacity
    }

    /// Exact occupancy, taken under the lock (blocks).
    pub fn occupied(&self) -> usize {
        self.slots.lock().occupied()
    }

    /// Exact free space, taken under the lock (blocks).
    pub fn free(&self) -> usize {
        self.capacity - 1 - self.occupied()
    }

    /// Append as many samples as fit. Returns the accepted count, or `None`
    /// when the lock could not be taken within the bounded wait.
    pub fn push(&self, samples: &[i16]) -> Option<usize> {
        let mut slots = self.slots.try_lock_for(self.lock_wait)?;
        let free = self.capacity - 1 - slots.occupied();
        let n = samples.len().min(free);
        if n == 0 {
            return Some(0);
        }

        let start = slots.write;
        let first = n.min(self.capacity - start);
        slots.data[start..start + first].copy_from_slice(&samples[..first]);
        if first < n {
            slots.data[..n - first].copy_from_slice(&samples[first..n]);
        }
        slots.write = (start + n) % self.capacity;
        self.write_hint.store(slots.write, Ordering::Release);
        Some(n)
    }

    /// Dequeue up to `out.len()` samples. Returns the count, or `None` when
    /// the lock could not be taken within the bounded wait.
    pub fn pop(&self, out: &mut [i16]) -> Option<usize> {
        let mut slots = self.slots.try_lock_for(self.lock_wait)?;
        let n = out.len().min(slots.occupied());
        if n == 0 {
            return Some(0);
        }

        let start = slots.read;
        let first = n.min(self.capacity - start);
        out[..first].copy_from_slice(&slots.data[start..start + first]);
        if first < n {
            out[first..n].copy_from_slice(&slots.data[..n - first]);
        }
        slots.read = (start + n) % self.capacity;
        self.read_hint.store(slots.read, Ordering::Release);
        Some(n)
    }

    /// Discard everything buffered by resetting both cursors. Returns the
    /// number of samples discarded.
    ///
    /// Waits for the lock without a bound: a clear must not be skipped, and
    /// the lock is never held across blocking I/O.
    pub fn clear(&self) -> usize {
        let mut slots = self.slots.lock();
        let discarded = slots.occupied();
        slots.write = 0;
        slots.read = 0;
        self.write_hint.store(0, Ordering::Release);
        self.read_hint.store(0, Ordering::Release);
        discarded
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity)
            .field("approx_occupied", &self.approx_occupied())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> SampleRing {
        SampleRing::new(capacity, Duration::from_millis(10))
    }

    #[test]
    fn push_is_bounded_by_free_space() {
        let r = ring(8);
        let accepted = r.push(&[1; 20]).expect("lock");
        assert_eq!(accepted, 7, "one slot is reserved");
        assert_eq!(r.occupied(), 7);
        assert_eq!(r.push(&[2; 3]), Some(0));
    }

    #[test]
    fn wraps_around_preserving_order() {
        let r = ring(8);
        r.push(&[1, 2, 3, 4, 5]).unwrap();
        let mut out = [0i16; 4];
        assert_eq!(r.pop(&mut out), Some(4));
        assert_eq!(out, [1, 2, 3, 4]);

        // Write crosses the end of the backing slice.
        assert_eq!(r.push(&[6, 7, 8, 9, 10, 11]), Some(6));
        let mut out = [0i16; 8];
        let n = r.pop(&mut out).unwrap();
        assert_eq!(&out[..n], &[5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(r.occupied(), 0);
    }

    #[test]
    fn occupancy_never_reaches_capacity() {
        let r = ring(64);
        let mut out = [0i16; 5];
        for step in 0..500usize {
            let burst = vec![step as i16; (step * 7) % 23];
            let free_before = r.free();
            let accepted = r.push(&burst).unwrap();
            assert!(accepted <= free_before);
            if step % 3 == 0 {
                r.pop(&mut out).unwrap();
            }
            assert!(r.occupied() <= r.capacity() - 1);
            assert_eq!(r.approx_occupied(), r.occupied());
        }
    }

    #[test]
    fn clear_resets_and_is_idempotent() {
        let r = ring(16);
        r.push(&[3; 10]).unwrap();
        assert_eq!(r.clear(), 10);
        assert_eq!(r.occupied(), 0);
        assert_eq!(r.clear(), 0);
        assert_eq!(r.approx_occupied(), 0);
    }

    #[test]
    fn lock_contention_fails_open() {
        let r = ring(16);
        let _held = r.slots.lock();
        assert_eq!(r.push(&[1, 2, 3]), None);
        let mut out = [0i16; 2];
        assert_eq!(r.pop(&mut out), None);
    }

    #[test]
    fn capacity_for_sixty_seconds() {
        let r = SampleRing::with_duration(16_000, 60, Duration::from_millis(20));
        assert_eq!(r.capacity(), 960_001);
    }
}
