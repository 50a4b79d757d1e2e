//! Byte encoding of replicated values.
//!
//! Values are stored as UTF-8 JSON. Replicas flagged `compressed` hold the
//! JSON as a gzip stream.

use crate::error::TargetError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::io::{Read, Write};

/// Requirements on the replicated application value.
///
/// Values are compared structurally and replaced wholesale, never mutated in
/// place.
pub trait Value: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where
    T: Clone + PartialEq + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Encode a value for a replica.
pub fn encode<V: Serialize>(value: &V, compressed: bool) -> Result<Vec<u8>, TargetError> {
    let json = serde_json::to_vec(value).map_err(|e| TargetError::Codec(e.to_string()))?;
    if !compressed {
        return Ok(json);
    }
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| TargetError::Codec(e.to_string()))?;
    encoder.finish().map_err(|e| TargetError::Codec(e.to_string()))
}

/// Decode a value read from a replica.
pub fn decode<V: DeserializeOwned>(bytes: &[u8], compressed: bool) -> Result<V, TargetError> {
    if !compressed {
        return serde_json::from_slice(bytes).map_err(|e| TargetError::Codec(e.to_string()));
    }
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(|e| TargetError::Codec(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| TargetError::Codec(e.to_string()))
}
