//! Versioned encoding of job state.
//!
//! Every blob is a JSON envelope `{"v": <version>, "data": <state>}`. The
//! manager stores and returns these bytes untouched; only the owning job type
//! decodes them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("failed to encode job state: {0}")]
    Encode(String),

    #[error("failed to decode job state: {0}")]
    Decode(String),

    #[error("unsupported job state version {found} (current is {current})")]
    UnsupportedVersion { found: u32, current: u32 },
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    v: u32,
    data: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    #[serde(default)]
    data: JsonValue,
}

/// Encode `state` under `version`.
pub fn encode<T: Serialize>(version: u32, state: &T) -> Result<Vec<u8>, StateError> {
    serde_json::to_vec(&EnvelopeRef { v: version, data: state })
        .map_err(|e| StateError::Encode(e.to_string()))
}

/// Split a blob into its version and raw data.
pub fn open(bytes: &[u8]) -> Result<(u32, JsonValue), StateError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| StateError::Decode(e.to_string()))?;
    Ok((envelope.v, envelope.data))
}

/// Decode a blob that must carry exactly `version`.
pub fn decode<T: DeserializeOwned>(version: u32, bytes: &[u8]) -> Result<T, StateError> {
    let (found, data) = open(bytes)?;
    if found != version {
        return Err(StateError::UnsupportedVersion {
            found,
            current: version,
        });
    }
    from_data(data)
}

pub(crate) fn from_data<T: DeserializeOwned>(data: JsonValue) -> Result<T, StateError> {
    serde_json::from_value(data).map_err(|e| StateError::Decode(e.to_string()))
}
