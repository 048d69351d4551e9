//! Single-producer / single-consumer sample ring protocol.
//!
//! A ring is a power-of-two byte buffer with two monotonically increasing
//! positions: `head`, written only by the producer, and `tail`, written only
//! by the consumer. Positions are absolute byte offsets; `pos & (capacity-1)`
//! gives the physical index. `head == tail` means empty, `head - tail` is the
//! number of unread bytes and never exceeds capacity.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consumer view of one event's per-CPU sample ring.
///
/// Ordering contract: `head()` is an acquire load, so payload bytes written
/// before the producer's release store of `head` are visible to `read()`.
/// `advance_tail()` is a release store, so the producer's acquire load of
/// `tail` may reclaim the consumed region.
pub trait RingBufferView: Send + Sync {
    /// Ring capacity in bytes. Always a power of two.
    fn capacity(&self) -> usize;

    /// Producer position (acquire).
    fn head(&self) -> u64;

    /// Consumer position.
    fn tail(&self) -> u64;

    /// Publish a new consumer position (release). `tail` must not pass the
    /// last observed `head`.
    fn advance_tail(&self, tail: u64);

    /// Copy `out.len()` bytes starting at absolute position `pos`, wrapping
    /// at capacity. Only positions in `[tail, head)` hold valid data.
    fn read(&self, pos: u64, out: &mut [u8]);
}

/// Heap-backed ring implementing the same protocol as the kernel's mmap'd
/// sample pages. Reference implementation for the consumer, producer half
/// used by tests and simulations.
pub struct MemoryRing {
    data: Box<[UnsafeCell<u8>]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
}

// SAFETY: the protocol permits exactly one producer (writes data, stores
// head) and one consumer (reads data, stores tail). Data slots are only
// written between the producer's tail load and head store, and only read
// between the consumer's head load and tail store, so no slot is accessed
// concurrently.
unsafe impl Send for MemoryRing {}
unsafe impl Sync for MemoryRing {}

impl MemoryRing {
    /// Create an empty ring. `capacity` must be a nonzero power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "ring capacity must be a nonzero power of two, got {capacity}"
        );

        let data = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        Self {
            data,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    /// True when `head == tail`.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side: append `bytes` and publish a new `head`.
    ///
    /// Returns false without writing anything if the ring lacks space.
    pub fn produce(&self, bytes: &[u8]) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        let free = self.data.len() - (head - tail) as usize;
        if bytes.len() > free {
            return false;
        }

        for (i, b) in bytes.iter().enumerate() {
            let idx = ((head + i as u64) & self.mask) as usize;
            // SAFETY: slots in [head, head+len) are unpublished; only this
            // producer touches them until the head store below.
            unsafe { *self.data[idx].get() = *b };
        }

        self.head.store(head + bytes.len() as u64, Ordering::Release);
        true
    }
}

impl RingBufferView for MemoryRing {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    fn tail(&self) -> u64 {
        self.tail.load(Ordering::Relaxed)
    }

    fn advance_tail(&self, tail: u64) {
        self.tail.store(tail, Ordering::Release);
    }

    fn read(&self, pos: u64, out: &mut [u8]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let idx = ((pos + i as u64) & self.mask) as usize;
            // SAFETY: the caller only reads published positions; the producer
            // does not rewrite them until tail passes.
            *slot = unsafe { *self.data[idx].get() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring() {
        let ring = MemoryRing::new(64);
        assert!(ring.is_empty());
        assert_eq!(ring.head(), ring.tail());
        assert_eq!(ring.capacity(), 64);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_rejects_non_power_of_two_capacity() {
        let _ = MemoryRing::new(100);
    }

    #[test]
    fn test_produce_and_read() {
        let ring = MemoryRing::new(64);
        assert!(ring.produce(&[1, 2, 3, 4]));
        assert_eq!(ring.len(), 4);

        let mut out = [0u8; 4];
        ring.read(ring.tail(), &mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        ring.advance_tail(ring.tail() + 4);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_produce_rejects_when_full() {
        let ring = MemoryRing::new(8);
        assert!(ring.produce(&[0; 8]));
        assert!(!ring.produce(&[1]));

        // Consuming frees space for the producer.
        ring.advance_tail(ring.tail() + 4);
        assert!(ring.produce(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_wraparound_read() {
        let ring = MemoryRing::new(8);

        // Advance positions to just before the wrap point.
        assert!(ring.produce(&[0; 6]));
        ring.advance_tail(6);

        // This record spans the physical end of the buffer.
        assert!(ring.produce(&[10, 11, 12, 13]));

        let mut out = [0u8; 4];
        ring.read(ring.tail(), &mut out);
        assert_eq!(out, [10, 11, 12, 13]);
    }

    #[test]
    fn test_positions_are_monotonic_across_wrap() {
        let ring = MemoryRing::new(8);

        for round in 0u8..10 {
            assert!(ring.produce(&[round; 8]));
            let tail = ring.tail();
            let mut out = [0u8; 8];
            ring.read(tail, &mut out);
            assert_eq!(out, [round; 8]);
            ring.advance_tail(tail + 8);
        }

        assert_eq!(ring.tail(), 80);
        assert_eq!(ring.head(), 80);
    }
}
