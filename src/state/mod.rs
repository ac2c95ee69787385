//! State that outlives a session: phase checkpoints.

mod checkpoint;

pub use checkpoint::{restore_into, Checkpoint, CheckpointEntry, CheckpointStore};
