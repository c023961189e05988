//! JSON bodies exchanged with the relay's direction endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::payload::HandshakePayload;

/// Which half of the handshake a store carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Initiator to responder.
    Offer,
    /// Responder back to initiator.
    Answer,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Offer, Direction::Answer];

    /// Route the relay serves this direction on.
    pub fn path(self) -> &'static str {
        match self {
            Direction::Offer => "/api/signal",
            Direction::Answer => "/api/answer",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Offer => "offer",
            Direction::Answer => "answer",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a successful `GET`: either `{signal, version}` or `{noUpdate: true}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<HandshakePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_update: bool,
}

impl PollBody {
    pub fn delivered(payload: HandshakePayload, version: u64) -> Self {
        Self {
            signal: Some(payload),
            version: Some(version),
            no_update: false,
        }
    }

    pub fn no_update() -> Self {
        Self {
            no_update: true,
            ..Self::default()
        }
    }

    pub fn into_outcome(self) -> Result<PollOutcome, WireError> {
        match (self.signal, self.version, self.no_update) {
            (_, _, true) => Ok(PollOutcome::NoUpdate),
            (Some(payload), Some(version), false) => Ok(PollOutcome::Delivered { payload, version }),
            (Some(_), None, false) => Err(WireError::MissingVersion),
            (None, _, false) => Err(WireError::MissingSignal),
        }
    }
}

/// Client view of a `200` poll response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Delivered { payload: HandshakePayload, version: u64 },
    NoUpdate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("relay response carried a signal without a version")]
    MissingVersion,
    #[error("relay response carried neither a signal nor noUpdate")]
    MissingSignal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

/// LAN address of the relay host, plus the configured public base URL if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIpResponse {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn no_update_serializes_as_flag_only() {
        let body = serde_json::to_string(&PollBody::no_update()).unwrap();
        assert_eq!(body, r#"{"noUpdate":true}"#);
    }

    #[test_timeout::timeout]
    fn parses_delivered_body() {
        let body: PollBody =
            serde_json::from_str(r#"{"signal":{"type":"answer","sdp":"x"},"version":1}"#).unwrap();
        match body.into_outcome().unwrap() {
            PollOutcome::Delivered { payload, version } => {
                assert_eq!(version, 1);
                assert_eq!(payload.as_bytes(), br#"{"type":"answer","sdp":"x"}"#);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn rejects_signal_without_version() {
        let body: PollBody = serde_json::from_str(r#"{"signal":{}}"#).unwrap();
        assert_eq!(body.into_outcome().unwrap_err(), WireError::MissingVersion);
        let empty: PollBody = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.into_outcome().unwrap_err(), WireError::MissingSignal);
    }
}
