use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("payload is null")]
    Null,
}

/// Offer or answer produced by a peer-connection primitive.
///
/// Held as the exact JSON text that was published and re-emitted verbatim; the
/// relay never looks inside it.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakePayload(Bytes);

impl HandshakePayload {
    /// Wrap raw JSON bytes, rejecting anything that is not a single non-null
    /// JSON value. A stored `null` would be served as a missing signal.
    pub fn from_json_bytes(bytes: impl Into<Bytes>) -> Result<Self, PayloadError> {
        let bytes = bytes.into();
        let raw = serde_json::from_slice::<&RawValue>(&bytes).map_err(PayloadError::InvalidJson)?;
        if raw.get() == "null" {
            return Err(PayloadError::Null);
        }
        Ok(Self(bytes))
    }

    pub fn from_value<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        let encoded = serde_json::to_vec(value).map_err(PayloadError::Encode)?;
        Self::from_json_bytes(encoded)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_slice(&self.0).map_err(PayloadError::Decode)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for HandshakePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakePayload({} bytes)", self.0.len())
    }
}

impl Serialize for HandshakePayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw: &RawValue =
            serde_json::from_slice(&self.0).map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HandshakePayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Self(Bytes::from(raw.get().to_owned())))
    }
}
