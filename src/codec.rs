// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Binary codec for wire messages and snapshots.
//!
//! The replication logic only depends on the [`Codec`] trait: encode a
//! [`Value`] to bytes and back, preserving numbers, strings, byte buffers and
//! nested maps. [`PostcardCodec`] is the default implementation.
//!
//! # Snapshot Compression
//!
//! Snapshots can be large, so they may be zstd-compressed before being put
//! in an IMPORT message. Compression is detected on the receiving side by the
//! zstd frame magic, so a sender may compress or not without negotiation.

use crate::error::{ReplicaError, Result};
use crate::value::Value;
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Encodes and decodes [`Value`]s.
///
/// Implementations must round-trip every value they produce.
pub trait Codec: Send + Sync + 'static {
    /// Encode a value to bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`encode`](Self::encode).
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default codec backed by `postcard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        postcard::to_allocvec(value).map_err(|e| ReplicaError::Codec(format!("encode: {}", e)))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        postcard::from_bytes(bytes).map_err(|e| ReplicaError::Codec(format!("decode: {}", e)))
    }
}

/// Compress `data` with zstd when it is at least `threshold` bytes long.
///
/// Smaller payloads are returned as-is.
pub fn maybe_compress(data: Vec<u8>, threshold: usize, level: i32) -> Result<Vec<u8>> {
    if data.len() < threshold {
        return Ok(data);
    }
    zstd::encode_all(&data[..], level)
        .map_err(|e| ReplicaError::Internal(format!("zstd encode: {}", e)))
}

/// Decompress zstd data if it has the zstd magic header, otherwise pass through.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicaError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicaError::Decompression(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
