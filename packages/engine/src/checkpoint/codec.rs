// packages/engine/src/checkpoint/codec.rs
//! Checkpoint payload encoding
//!
//! Snapshots are serialized as JSON and compressed with zstd. Frames carry a
//! content checksum so truncated or bit-flipped payloads are detected on load.

use super::model::{ExecutionSnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

/// Compression levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Fast compression (level 1)
    Fast,

    /// Balanced (level 3)
    Balanced,

    /// Best compression (level 19)
    Best,
}

impl CompressionLevel {
    pub fn as_i32(&self) -> i32 {
        match self {
            CompressionLevel::Fast => 1,
            CompressionLevel::Balanced => 3,
            CompressionLevel::Best => 19,
        }
    }
}

/// Encoder/decoder for [`ExecutionSnapshot`] payloads
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    level: CompressionLevel,
}

impl PayloadCodec {
    pub fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub fn encode(&self, snapshot: &ExecutionSnapshot) -> Result<Bytes> {
        let json = serde_json::to_vec(snapshot)?;
        let compressed = self.compress(&json)?;
        Ok(Bytes::from(compressed))
    }

    /// Decode a payload. Anything unreadable is reported as corruption.
    pub fn decode(&self, payload: &[u8]) -> Result<ExecutionSnapshot> {
        let json = self.decompress(payload).map_err(|e| {
            EngineError::CheckpointCorrupted(format!("payload does not decompress: {}", e))
        })?;

        let snapshot: ExecutionSnapshot = serde_json::from_slice(&json).map_err(|e| {
            EngineError::CheckpointCorrupted(format!("payload does not parse: {}", e))
        })?;

        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(EngineError::CheckpointCorrupted(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }

        Ok(snapshot)
    }

    /// Compress data
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let level = self.level.as_i32();
        let compression_error =
            |e: std::io::Error| EngineError::CompressionFailed(format!("Compression error: {}", e));

        let mut encoder =
            zstd::stream::Encoder::new(Vec::with_capacity(data.len() / 4), level)
                .map_err(compression_error)?;
        encoder.include_checksum(true).map_err(compression_error)?;
        encoder.write_all(data).map_err(compression_error)?;
        let compressed = encoder.finish().map_err(compression_error)?;

        debug!(
            "Compressed {} bytes -> {} bytes at level {}",
            data.len(),
            compressed.len(),
            level
        );

        Ok(compressed)
    }

    /// Decompress data
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| {
            EngineError::CompressionFailed(format!("Decompression error: {}", e))
        })
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(CompressionLevel::Balanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::execution::Execution;
    use crate::utils::ids::{GraphId, InstanceId};
    use chrono::Utc;

    fn snapshot() -> ExecutionSnapshot {
        let instance_id = InstanceId::generate();
        let mut execution = Execution::new(GraphId::new("graph_demo"), instance_id.clone(), "plan");
        execution
            .scratch_state
            .insert("topic".to_string(), serde_json::json!("rust"));
        ExecutionSnapshot::new(instance_id, Some(execution), None, Utc::now())
    }

    #[test]
    fn test_compression_levels() {
        assert_eq!(CompressionLevel::Fast.as_i32(), 1);
        assert_eq!(CompressionLevel::Balanced.as_i32(), 3);
        assert_eq!(CompressionLevel::Best.as_i32(), 19);
    }

    #[test]
    fn test_encode_decode() {
        let codec = PayloadCodec::default();
        let original = snapshot();
        let payload = codec.encode(&original).unwrap();
        assert_eq!(codec.decode(&payload).unwrap(), original);
    }

    #[test]
    fn test_repetitive_state_compresses() {
        let codec = PayloadCodec::new(CompressionLevel::Balanced);
        let data = r#"{"node":"plan","visits":1}"#.repeat(500);
        let compressed = codec.compress(data.as_bytes()).unwrap();
        assert!(compressed.len() * 5 < data.len());
    }

    #[test]
    fn test_flipped_byte_is_corruption() {
        let codec = PayloadCodec::default();
        let mut payload = codec.encode(&snapshot()).unwrap().to_vec();
        let middle = payload.len() / 2;
        payload[middle] ^= 0xff;
        let err = codec.decode(&payload).unwrap_err();
        assert!(matches!(err, EngineError::CheckpointCorrupted(_)));
    }

    #[test]
    fn test_garbage_is_corruption() {
        let codec = PayloadCodec::default();
        let err = codec.decode(b"definitely not zstd").unwrap_err();
        assert!(matches!(err, EngineError::CheckpointCorrupted(_)));
    }

    #[test]
    fn test_unknown_format_version_is_corruption() {
        let codec = PayloadCodec::default();
        let mut future = snapshot();
        future.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        let payload = codec.encode(&future).unwrap();
        let err = codec.decode(&payload).unwrap_err();
        assert!(matches!(err, EngineError::CheckpointCorrupted(_)));
    }
}
