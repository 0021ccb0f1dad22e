//! Base64 serialization for binary widget buffers.
//!
//! Widget model messages carry raw binary buffers next to their JSON state.
//! On every JSON wire (consumer notifications, kernel IPC frames, the disk
//! cache) those buffers travel as base64 strings.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialize a slice of Bytes as base64-encoded strings.
///
/// Used with `#[serde(serialize_with = "serialize_buffers")]`
pub fn serialize_buffers<S>(data: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    data.iter()
        .map(|bytes| BASE64_STANDARD.encode(bytes))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// Deserialize base64-encoded buffer strings into Bytes.
///
/// `null` and a missing field both yield an empty Vec.
///
/// Used with `#[serde(default, deserialize_with = "deserialize_buffers")]`
pub fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<Vec<String>> = Option::deserialize(deserializer)?;
    match encoded {
        Some(vec) => vec
            .iter()
            .map(|s| {
                BASE64_STANDARD
                    .decode(s)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .collect(),
        None => Ok(Vec::new()),
    }
}
