//! Delivered-version bookkeeping on both sides of the relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What an overwrite does to consumers that already received an earlier payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    /// Last write wins, but a client already holding the delivered version is
    /// not told about the new payload.
    #[default]
    KeepDelivered,
    /// A distinct overwrite bumps the delivered version on the next poll so the
    /// new payload reaches every client again.
    Redeliver,
}

impl OverwritePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OverwritePolicy::KeepDelivered => "keep-delivered",
            OverwritePolicy::Redeliver => "redeliver",
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown overwrite policy `{0}` (expected keep-delivered or redeliver)")]
pub struct UnknownPolicy(String);

impl FromStr for OverwritePolicy {
    type Err = UnknownPolicy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keep-delivered" | "keep_delivered" | "keep" => Ok(OverwritePolicy::KeepDelivered),
            "redeliver" => Ok(OverwritePolicy::Redeliver),
            other => Err(UnknownPolicy(other.to_owned())),
        }
    }
}

/// Relay-side counter for one record: how far delivery has progressed.
///
/// The counter never decreases. `0` means the payload was never handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryVersion {
    delivered: u64,
    stale: bool,
}

impl DeliveryVersion {
    pub fn current(&self) -> u64 {
        self.delivered
    }

    /// Whether a client that already holds `known` should receive the payload.
    pub fn should_deliver(&self, known: u64) -> bool {
        self.delivered == 0 || known < self.delivered || self.stale
    }

    /// Record a delivery and return the version handed to the client.
    pub fn deliver(&mut self) -> u64 {
        if self.stale {
            self.delivered += 1;
            self.stale = false;
        } else {
            self.delivered = self.delivered.max(1);
        }
        self.delivered
    }

    /// Account for a write over an existing record.
    pub fn note_overwrite(&mut self, policy: OverwritePolicy, changed: bool) {
        if policy == OverwritePolicy::Redeliver && changed && self.delivered > 0 {
            self.stale = true;
        }
    }
}

/// Client-side memory of the largest version seen for one record.
///
/// Echoed back on every poll so the relay can answer `noUpdate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct KnownVersion(u64);

impl KnownVersion {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns true when `version` moved the floor forward.
    pub fn observe(&mut self, version: u64) -> bool {
        if version > self.0 {
            self.0 = version;
            true
        } else {
            false
        }
    }
}
