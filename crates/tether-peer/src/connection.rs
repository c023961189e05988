use std::collections::VecDeque;

use bytes::Bytes;
use tether_core::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::adapter::{BackendError, PeerBackend, PeerChannel, PeerEvent};
use crate::negotiation::{NegotiationError, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Data(Bytes),
    Closed,
    Error(BackendError),
}

/// An open data channel handed back once negotiation succeeds.
///
/// The relay is no longer involved; bytes go straight to the peer.
pub struct Connection<B: PeerBackend> {
    session: SessionId,
    role: Role,
    channel: PeerChannel<B>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    backlog: VecDeque<Bytes>,
}

impl<B: PeerBackend> Connection<B> {
    pub(crate) fn new(
        session: SessionId,
        role: Role,
        channel: PeerChannel<B>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        early_data: Vec<Bytes>,
    ) -> Self {
        Self {
            session,
            role,
            channel,
            events,
            backlog: early_data.into(),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), NegotiationError> {
        self.channel.send(data.into()).await
    }

    /// Next inbound message. Yields `Closed` or `Error` once, then `None`.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        if let Some(data) = self.backlog.pop_front() {
            return Some(ConnectionEvent::Data(data));
        }
        if self.channel.is_finished() {
            return None;
        }
        loop {
            match self.events.recv().await {
                Some(PeerEvent::Data(data)) => return Some(ConnectionEvent::Data(data)),
                Some(PeerEvent::ChannelClosed) | None => {
                    self.channel.mark_finished();
                    debug!(session = %self.session, "data channel closed");
                    return Some(ConnectionEvent::Closed);
                }
                Some(PeerEvent::Error(err)) => {
                    self.channel.mark_finished();
                    debug!(session = %self.session, error = %err, "data channel failed");
                    return Some(ConnectionEvent::Error(err));
                }
                Some(other) => trace!(session = %self.session, ?other, "ignoring event after open"),
            }
        }
    }

    pub async fn close(mut self) {
        self.channel.close().await;
    }
}
