// src/transport/spsc.rs
//
// Bounded single-producer single-consumer ring, the transport between lanes.
//
// Contract:
//   - Exactly one thread pushes, exactly one thread pops. The split
//     Producer/Consumer handles make this a compile-time property.
//   - Capacity must be a power of two.
//   - Full is a normal outcome: it is counted on the shared drop counter
//     and never surfaced as an error to the pipeline.
//
// The producer keeps a private cached copy of the consumer's head (and vice
// versa) so the fast path never touches the remote cache line; the cache is
// refreshed from the shared atomic only when the local view says the ring
// is full/empty. One release store publishes an element, one acquire load
// consumes it. Counters are 64-bit and never reset within a run.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Staged backoff used by the blocking push/pop variants:
/// spin, then yield, then short sleeps of increasing length.
pub(crate) struct Backoff {
    count: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { count: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.count < 8 {
            std::hint::spin_loop();
        } else if self.count < 16 {
            std::thread::yield_now();
        } else if self.count < 32 {
            std::thread::sleep(Duration::from_micros(1));
        } else {
            std::thread::sleep(Duration::from_micros(10));
        }
        self.count += 1;
    }
}

/// Rejected push carrying the element back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub struct PushError<T>(pub T);

/// Telemetry readable from either endpoint. Approximate under concurrency,
/// never torn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub pushed: u64,
    pub popped: u64,
    pub dropped: u64,
    pub len: usize,
    pub capacity: usize,
}

struct Shared<T> {
    tail: CachePadded<AtomicU64>,
    head: CachePadded<AtomicU64>,
    pushed: AtomicU64,
    popped: AtomicU64,
    dropped: AtomicU64,
    mask: u64,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Shared<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn stats(&self) -> RingStats {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        RingStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            len: tail.saturating_sub(head) as usize,
            capacity: self.capacity(),
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        // Both endpoints are gone; destroy whatever is still queued.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for seq in head..tail {
            let slot = &self.slots[(seq & self.mask) as usize];
            unsafe { (*slot.get()).assume_init_drop() };
        }
    }
}

/// Create a bounded SPSC ring of the given power-of-two capacity.
pub fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity >= 2 && capacity.is_power_of_two(),
        "spsc ring capacity must be a power of two >= 2, got {capacity}"
    );

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let shared = Arc::new(Shared {
        tail: CachePadded::new(AtomicU64::new(0)),
        head: CachePadded::new(AtomicU64::new(0)),
        pushed: AtomicU64::new(0),
        popped: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        mask: capacity as u64 - 1,
        slots,
    });

    (
        Producer {
            shared: shared.clone(),
            cached_head: 0,
        },
        Consumer {
            shared,
            cached_tail: 0,
        },
    )
}

// ============================================================================
// Producer endpoint
// ============================================================================

pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    cached_head: u64,
}

impl<T> Producer<T> {
    /// Non-blocking push. On a full ring the drop counter is incremented and
    /// the element is handed back.
    pub fn try_push(&mut self, item: T) -> Result<(), PushError<T>> {
        match self.push_inner(item) {
            Ok(()) => Ok(()),
            Err(item) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Err(PushError(item))
            }
        }
    }

    /// Blocking push with a deadline. Spins through the staged backoff until
    /// space frees up; a timeout counts as a single drop.
    pub fn push_wait(&mut self, item: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        let mut item = item;
        loop {
            match self.push_inner(item) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    if Instant::now() >= deadline {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        return Err(PushError(back));
                    }
                    item = back;
                    backoff.snooze();
                }
            }
        }
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    fn push_inner(&mut self, item: T) -> Result<(), T> {
        let shared = &*self.shared;
        let capacity = shared.capacity() as u64;
        let tail = shared.tail.load(Ordering::Relaxed);

        // Fast path: trust the cached head. Refresh only when it says full.
        if tail.wrapping_sub(self.cached_head) >= capacity {
            self.cached_head = shared.head.load(Ordering::Acquire);
            if tail.wrapping_sub(self.cached_head) >= capacity {
                return Err(item);
            }
        }

        let slot = &shared.slots[(tail & shared.mask) as usize];
        unsafe { (*slot.get()).write(item) };

        // Publish: the consumer's acquire load pairs with this release.
        shared.tail.store(tail + 1, Ordering::Release);
        shared.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ============================================================================
// Consumer endpoint
// ============================================================================

pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    cached_tail: u64,
}

impl<T> Consumer<T> {
    /// Non-blocking pop.
    pub fn try_pop(&mut self) -> Option<T> {
        let shared = &*self.shared;
        let head = shared.head.load(Ordering::Relaxed);

        if head == self.cached_tail {
            self.cached_tail = shared.tail.load(Ordering::Acquire);
            if head == self.cached_tail {
                return None;
            }
        }

        let slot = &shared.slots[(head & shared.mask) as usize];
        let item = unsafe { (*slot.get()).assume_init_read() };

        shared.head.store(head + 1, Ordering::Release);
        shared.popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Blocking pop with a deadline; returns None on timeout.
    pub fn pop_wait(&mut self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if Instant::now() >= deadline {
                return None;
            }
            backoff.snooze();
        }
    }

    /// Drain up to `max` items into `dst`. Returns the number popped.
    pub fn try_pop_batch(&mut self, dst: &mut Vec<T>, max: usize) -> usize {
        let mut popped = 0;
        while popped < max {
            match self.try_pop() {
                Some(item) => {
                    dst.push(item);
                    popped += 1;
                }
                None => break,
            }
        }
        popped
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = ring::<u32>(8);
        for i in 0..5 {
            tx.try_push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_full_burst_drops_exactly_one() {
        let n = 64;
        let (mut tx, rx) = ring::<u64>(n);

        for i in 0..n as u64 {
            assert!(tx.try_push(i).is_ok());
        }
        // (N+1)-th push fails and bumps the drop counter by exactly one.
        assert_eq!(tx.try_push(999), Err(PushError(999)));
        let stats = tx.stats();
        assert_eq!(stats.pushed, n as u64);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.len, n);
        drop(rx);
    }

    #[test]
    fn test_wraparound_reuses_slots() {
        let (mut tx, mut rx) = ring::<u64>(4);
        for round in 0..10u64 {
            for i in 0..4 {
                tx.try_push(round * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(rx.try_pop(), Some(round * 4 + i));
            }
        }
        assert_eq!(tx.stats().pushed, 40);
        assert_eq!(rx.stats().popped, 40);
    }

    #[test]
    fn test_batch_pop() {
        let (mut tx, mut rx) = ring::<u32>(16);
        for i in 0..10 {
            tx.try_push(i).unwrap();
        }
        let mut out = Vec::new();
        assert_eq!(rx.try_pop_batch(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);
        assert_eq!(rx.try_pop_batch(&mut out, 100), 6);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_pop_wait_times_out() {
        let (_tx, mut rx) = ring::<u32>(4);
        let t0 = Instant::now();
        assert_eq!(rx.pop_wait(Duration::from_millis(5)), None);
        assert!(t0.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_cross_thread_transfer() {
        let (mut tx, mut rx) = ring::<u64>(256);
        let total = 10_000u64;

        let producer = std::thread::spawn(move || {
            for i in 0..total {
                while tx.try_push(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });

        let mut received = 0u64;
        let mut sum = 0u64;
        while received < total {
            if let Some(v) = rx.pop_wait(Duration::from_millis(100)) {
                sum += v;
                received += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(sum, total * (total - 1) / 2);
    }

    #[test]
    fn test_queued_items_dropped_with_ring() {
        use std::sync::atomic::AtomicUsize;
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Token;
        impl Drop for Token {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (mut tx, rx) = ring::<Token>(8);
        for _ in 0..5 {
            tx.try_push(Token).unwrap();
        }
        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }
}
