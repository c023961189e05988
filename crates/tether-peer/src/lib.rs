//! Client side of Tether pairing.
//!
//! [`negotiate`] drives one offer/answer exchange through a [`SignalRelay`]
//! and hands back a [`Connection`] once the peer-to-peer data channel opens.
//! The relay can be reached over HTTP ([`HttpRelay`]) or shared in-process
//! ([`LocalRelay`]); the peer connection itself comes from a [`PeerBackend`]
//! such as [`WebRtcBackend`].

pub mod adapter;
pub mod connection;
pub mod mock;
pub mod negotiation;
pub mod relay;
pub mod rtc;

pub use adapter::{BackendError, PeerBackend, PeerChannel, PeerEvent, PeerEvents};
pub use connection::{Connection, ConnectionEvent};
pub use negotiation::{
    negotiate, NegotiationConfig, NegotiationError, NegotiationHandle, NegotiationState, Role,
};
pub use relay::{HttpRelay, LocalRelay, RelayError, SignalRelay};
pub use rtc::{WebRtcBackend, WebRtcConfig};
