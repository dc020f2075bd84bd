//! Checkpoint store and committer.
//!
//! Checkpoints live at `{checkpoint.path}/_freshet/{pipeline}_checkpoint.json`
//! and are written through a temp file and a rename, so a reader never sees
//! a partial record.

mod committer;
mod state;
mod store;

pub use committer::{CheckpointCommitter, CommitStats};
pub use state::{CheckpointRecord, TokenState};
pub use store::{CheckpointStore, MemoryCheckpointStore, StorageCheckpointStore};

/// Directory holding checkpoint objects.
pub const CHECKPOINT_DIR: &str = "_freshet";
