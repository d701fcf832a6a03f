// src/transport/snapshot.rs
//
// Double-buffered, sequence-stamped snapshot channel for cross-lane state
// (semantic risk summary, signature match, semantic state marker).
//
// Publication protocol, in order:
//   1. allocate a new sequence id (monotonic per channel)
//   2. copy the payload into the inactive slot
//   3. stamp the slot's sequence id after the copy
//   4. release fence covering the slot contents
//   5. flip the active-index atomic with release ordering
//
// Readers acquire-load the index and structurally copy the referenced slot.
// The writer never writes into the active slot, so the copy cannot tear and
// the sequence id a reader sees always belongs to the body it copied.
// Exactly two instances of the payload are live at all times.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A coherent published record: the payload plus the sequence id of the
/// publish that produced it. Sequence 0 means nothing was published yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot<T> {
    pub sequence_id: u32,
    pub value: T,
}

struct Slot<T> {
    sequence_id: u32,
    value: T,
}

struct Shared<T> {
    slots: [UnsafeCell<Slot<T>>; 2],
    active: AtomicUsize,
    write_seq: AtomicU32,
}

unsafe impl<T: Send + Clone> Send for Shared<T> {}
unsafe impl<T: Send + Clone> Sync for Shared<T> {}

/// Create a snapshot channel. The writer half is unique (single writer is a
/// compile-time property); readers are cheap to clone.
pub fn snapshot_channel<T: Clone + Default>() -> (SnapshotWriter<T>, SnapshotReader<T>) {
    let shared = Arc::new(Shared {
        slots: [
            UnsafeCell::new(Slot {
                sequence_id: 0,
                value: T::default(),
            }),
            UnsafeCell::new(Slot {
                sequence_id: 0,
                value: T::default(),
            }),
        ],
        active: AtomicUsize::new(0),
        write_seq: AtomicU32::new(0),
    });
    (
        SnapshotWriter {
            shared: shared.clone(),
        },
        SnapshotReader { shared },
    )
}

// ============================================================================
// Writer endpoint (unique)
// ============================================================================

pub struct SnapshotWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Default> SnapshotWriter<T> {
    /// Publish a new payload. Returns the sequence id assigned to it.
    pub fn publish(&mut self, value: T) -> u32 {
        let shared = &*self.shared;
        let write_idx = 1 - shared.active.load(Ordering::Acquire);
        let seq = shared.write_seq.fetch_add(1, Ordering::Relaxed) + 1;

        // The writer is the only thread that ever touches the inactive slot.
        unsafe {
            let slot = &mut *shared.slots[write_idx].get();
            slot.value = value;
            slot.sequence_id = seq;
        }

        fence(Ordering::Release);
        shared.active.store(write_idx, Ordering::Release);
        seq
    }

    /// Sequence id of the latest publish (0 if none yet).
    pub fn last_sequence(&self) -> u32 {
        self.shared.write_seq.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Reader endpoint (cloneable)
// ============================================================================

pub struct SnapshotReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SnapshotReader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Default> SnapshotReader<T> {
    /// Take a structural copy of the active slot.
    pub fn read(&self) -> Snapshot<T> {
        let shared = &*self.shared;
        let idx = shared.active.load(Ordering::Acquire);
        unsafe {
            let slot = &*shared.slots[idx].get();
            Snapshot {
                sequence_id: slot.sequence_id,
                value: slot.value.clone(),
            }
        }
    }
}
