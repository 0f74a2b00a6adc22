// packages/engine/src/checkpoint/mod.rs
//! Checkpoint store adapter
//!
//! Serializes execution state into immutable checkpoints and moves them
//! through an external durable store:
//!
//! - **Model**: checkpoint metadata, recovery descriptors, snapshot payloads
//! - **Codec**: JSON + zstd payload encoding with frame checksums
//! - **Store**: the durable store contract, with memory and SQLite backends
//! - **Adapter**: size limits, deadlines and the per-instance catalog

pub mod adapter;
pub mod codec;
pub mod memory_store;
pub mod model;
pub mod sqlite_store;
pub mod store;

pub use adapter::CheckpointAdapter;
pub use codec::{CompressionLevel, PayloadCodec};
pub use memory_store::MemoryCheckpointStore;
pub use model::{
    Checkpoint, CheckpointKind, CheckpointRef, ExecutionSnapshot, RecoveryDescriptor,
    SNAPSHOT_FORMAT_VERSION,
};
pub use sqlite_store::{SqliteCheckpointStore, SqliteStoreConfig};
pub use store::DurableCheckpointStore;
