//! In-process backend pair for exercising negotiation without sockets.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tether_core::HandshakePayload;

use crate::adapter::{BackendError, PeerBackend, PeerEvent, PeerEvents};
use crate::negotiation::Role;

#[derive(Default)]
struct Link {
    ends: [Option<PeerEvents>; 2],
    connected: bool,
}

impl Link {
    fn emit(&self, side: usize, event: PeerEvent) {
        if let Some(events) = &self.ends[side] {
            let _ = events.send(event);
        }
    }
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One end of a fake peer connection. The initiator's offer and the
/// responder's answer are small JSON blobs; the channel opens on both ends when
/// the initiator applies the answer.
pub struct MockBackend {
    side: usize,
    link: Arc<Mutex<Link>>,
    role: Option<Role>,
    reject_remote: bool,
}

impl MockBackend {
    pub fn pair() -> (MockBackend, MockBackend) {
        let link = Arc::new(Mutex::new(Link::default()));
        let end = |side| MockBackend {
            side,
            link: Arc::clone(&link),
            role: None,
            reject_remote: false,
        };
        (end(0), end(1))
    }

    /// Fail every remote payload with a setup error.
    pub fn rejecting_remote(mut self) -> Self {
        self.reject_remote = true;
        self
    }

    /// Handle for injecting failures into this end after it is moved away.
    pub fn faults(&self) -> MockFaults {
        MockFaults {
            side: self.side,
            link: Arc::clone(&self.link),
        }
    }

    fn payload(&self, kind: &str) -> Result<HandshakePayload, BackendError> {
        let sdp = format!("mock-{kind}-{}", self.side);
        HandshakePayload::from_value(&json!({ "type": kind, "sdp": sdp }))
            .map_err(|err| BackendError::Setup(err.to_string()))
    }
}

#[async_trait]
impl PeerBackend for MockBackend {
    async fn start(&mut self, role: Role, events: PeerEvents) -> Result<(), BackendError> {
        self.role = Some(role);
        let offer = self.payload("offer")?;
        let mut link = lock(&self.link);
        link.ends[self.side] = Some(events);
        if role == Role::Initiator {
            link.emit(self.side, PeerEvent::LocalPayload(offer));
        }
        Ok(())
    }

    async fn apply_remote(&mut self, _payload: HandshakePayload) -> Result<(), BackendError> {
        if self.reject_remote {
            return Err(BackendError::Setup("mock backend rejected remote payload".into()));
        }
        match self.role {
            Some(Role::Responder) => {
                let answer = self.payload("answer")?;
                lock(&self.link).emit(self.side, PeerEvent::LocalPayload(answer));
                Ok(())
            }
            Some(Role::Initiator) => {
                let mut link = lock(&self.link);
                link.connected = true;
                link.emit(0, PeerEvent::ChannelOpen);
                link.emit(1, PeerEvent::ChannelOpen);
                Ok(())
            }
            None => Err(BackendError::Setup("backend not started".into())),
        }
    }

    async fn send(&self, data: Bytes) -> Result<(), BackendError> {
        let link = lock(&self.link);
        if !link.connected {
            return Err(BackendError::ChannelClosed);
        }
        link.emit(1 - self.side, PeerEvent::Data(data));
        Ok(())
    }

    async fn close(&mut self) {
        let mut link = lock(&self.link);
        if link.connected {
            link.connected = false;
            link.emit(1 - self.side, PeerEvent::ChannelClosed);
        }
        link.ends[self.side] = None;
    }
}

/// Injects backend failures into one end of a [`MockBackend`] pair.
#[derive(Clone)]
pub struct MockFaults {
    side: usize,
    link: Arc<Mutex<Link>>,
}

impl MockFaults {
    pub fn error(&self, message: &str) {
        lock(&self.link).emit(self.side, PeerEvent::Error(BackendError::Setup(message.into())));
    }

    pub fn close(&self) {
        lock(&self.link).emit(self.side, PeerEvent::ChannelClosed);
    }
}
