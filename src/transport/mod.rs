// src/transport/mod.rs

pub mod snapshot;
pub mod spsc;

pub use snapshot::{snapshot_channel, Snapshot, SnapshotReader, SnapshotWriter};
pub use spsc::{ring, Consumer, Producer, PushError, RingStats};
