//! Persistence module for Cinder
//!
//! Checkpoint metadata and hash index snapshots. The log segments themselves
//! are owned by the storage engine; this module only records where a
//! consistent log prefix ends and what the index looked like there.

mod checkpoint;
mod snapshot;

pub use checkpoint::{
    CheckpointConfig, CheckpointId, CheckpointManager, CheckpointMetadata, CheckpointResult,
};
pub use snapshot::{
    decode_snapshot, encode_snapshot, read_snapshot, write_snapshot, FLAG_VALID, SNAPSHOT_MAGIC,
    SNAPSHOT_VERSION,
};
