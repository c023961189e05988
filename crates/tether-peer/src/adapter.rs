//! Glue between a peer-connection primitive and the negotiation loop.

use async_trait::async_trait;
use bytes::Bytes;
use tether_core::HandshakePayload;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::negotiation::{NegotiationError, Role};

/// Failures raised by a peer-connection backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("timed out waiting for the peer connection")]
    Timeout,
    #[error("data channel closed")]
    ChannelClosed,
}

/// What a backend reports while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Offer or answer, complete with candidates, ready to publish.
    LocalPayload(HandshakePayload),
    ChannelOpen,
    Data(Bytes),
    ChannelClosed,
    Error(BackendError),
}

pub type PeerEvents = mpsc::UnboundedSender<PeerEvent>;

/// A peer-connection primitive, one instance per negotiation attempt.
#[async_trait]
pub trait PeerBackend: Send + Sync + 'static {
    /// Begin the attempt. Initiators emit their offer as a [`PeerEvent::LocalPayload`].
    async fn start(&mut self, role: Role, events: PeerEvents) -> Result<(), BackendError>;

    /// Hand over the peer's offer or answer. Responders emit their answer afterwards.
    async fn apply_remote(&mut self, payload: HandshakePayload) -> Result<(), BackendError>;

    async fn send(&self, data: Bytes) -> Result<(), BackendError>;

    async fn close(&mut self);
}

/// Enforces the adapter contract on top of a [`PeerBackend`].
///
/// The local payload is published at most once, the remote payload is applied
/// at most once, and sending requires an open channel.
pub struct PeerChannel<B> {
    backend: B,
    local: Option<HandshakePayload>,
    remote: Option<HandshakePayload>,
    open: bool,
    finished: bool,
}

impl<B: PeerBackend> PeerChannel<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            local: None,
            remote: None,
            open: false,
            finished: false,
        }
    }

    pub async fn start(&mut self, role: Role, events: PeerEvents) -> Result<(), NegotiationError> {
        self.backend.start(role, events).await?;
        Ok(())
    }

    /// Returns the payload to publish, or `None` if this exact payload was already accepted.
    pub fn accept_local(
        &mut self,
        payload: HandshakePayload,
    ) -> Result<Option<HandshakePayload>, NegotiationError> {
        match &self.local {
            None => {
                self.local = Some(payload.clone());
                Ok(Some(payload))
            }
            Some(existing) if *existing == payload => {
                trace!("ignoring repeated local payload");
                Ok(None)
            }
            Some(_) => Err(NegotiationError::ProtocolViolation(
                "backend produced a second, different local payload".into(),
            )),
        }
    }

    /// Returns `false` when the payload was already applied.
    pub async fn apply_remote(&mut self, payload: HandshakePayload) -> Result<bool, NegotiationError> {
        match &self.remote {
            Some(existing) if *existing == payload => {
                trace!("remote payload already applied");
                Ok(false)
            }
            Some(_) => Err(NegotiationError::ProtocolViolation(
                "received a second, different remote payload".into(),
            )),
            None => {
                self.remote = Some(payload.clone());
                debug!(bytes = payload.len(), "applying remote payload");
                self.backend.apply_remote(payload).await?;
                Ok(true)
            }
        }
    }

    /// Returns `true` the first time the channel opens.
    pub fn mark_open(&mut self) -> bool {
        if self.open || self.finished {
            return false;
        }
        self.open = true;
        true
    }

    /// Returns `true` the first time the channel closes or fails.
    pub fn mark_finished(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.open = false;
        self.finished = true;
        true
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn send(&self, data: Bytes) -> Result<(), NegotiationError> {
        if !self.open {
            return Err(NegotiationError::NotConnected);
        }
        self.backend.send(data).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        self.mark_finished();
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        applied: Arc<Mutex<Vec<HandshakePayload>>>,
        sent: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl PeerBackend for Recorder {
        async fn start(&mut self, _role: Role, _events: PeerEvents) -> Result<(), BackendError> {
            Ok(())
        }

        async fn apply_remote(&mut self, payload: HandshakePayload) -> Result<(), BackendError> {
            self.applied.lock().unwrap().push(payload);
            Ok(())
        }

        async fn send(&self, data: Bytes) -> Result<(), BackendError> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    fn payload(sdp: &str) -> HandshakePayload {
        HandshakePayload::from_value(&serde_json::json!({ "type": "offer", "sdp": sdp })).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn remote_payload_is_applied_once() {
        let recorder = Recorder::default();
        let mut channel = PeerChannel::new(recorder.clone());

        assert!(channel.apply_remote(payload("a")).await.unwrap());
        assert!(!channel.apply_remote(payload("a")).await.unwrap());
        assert!(matches!(
            channel.apply_remote(payload("b")).await,
            Err(NegotiationError::ProtocolViolation(_))
        ));
        assert_eq!(recorder.applied.lock().unwrap().len(), 1);
    }

    #[test_timeout::timeout]
    fn local_payload_is_published_once() {
        let mut channel = PeerChannel::new(Recorder::default());
        assert!(channel.accept_local(payload("a")).unwrap().is_some());
        assert!(channel.accept_local(payload("a")).unwrap().is_none());
        assert!(channel.accept_local(payload("b")).is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn send_requires_an_open_channel() {
        let recorder = Recorder::default();
        let mut channel = PeerChannel::new(recorder.clone());
        assert!(matches!(
            channel.send(Bytes::from_static(b"hi")).await,
            Err(NegotiationError::NotConnected)
        ));

        assert!(channel.mark_open());
        assert!(!channel.mark_open());
        channel.send(Bytes::from_static(b"hi")).await.unwrap();

        assert!(channel.mark_finished());
        assert!(matches!(
            channel.send(Bytes::from_static(b"late")).await,
            Err(NegotiationError::NotConnected)
        ));
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }
}
