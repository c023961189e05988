//! Core primitives shared by the Tether relay and the pairing clients.
//!
//! The relay keeps one [`SessionStore`] per negotiation [`Direction`] and hands
//! each stored [`HandshakePayload`] out under a monotonically growing delivered
//! version, so clients can poll the same record repeatedly without being handed
//! a payload they already applied.

pub mod id;
pub mod payload;
pub mod store;
pub mod version;
pub mod wire;

pub use id::SessionId;
pub use payload::{HandshakePayload, PayloadError};
pub use store::{Delivery, PutOutcome, SessionRegistry, SessionStore, StoreConfig, StoreError};
pub use version::{DeliveryVersion, KnownVersion, OverwritePolicy, UnknownPolicy};
pub use wire::{Direction, ErrorBody, LocalIpResponse, PollBody, PollOutcome, PutResponse, WireError};
