//! The polling state machine that carries one offer/answer exchange.
//!
//! Each side runs a single task. It publishes the local payload produced by its
//! backend, polls the opposite direction for the peer's payload on a fixed
//! interval, and stops as soon as the data channel opens, fails, times out or
//! is cancelled. At most one poll is outstanding at a time; a tick that fires
//! while one is in flight is skipped. An initiator stays [`NegotiationState::Idle`]
//! and does not poll until its offer is stored on the relay.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether_core::{Direction, HandshakePayload, KnownVersion, PollOutcome, SessionId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapter::{BackendError, PeerBackend, PeerChannel, PeerEvent};
use crate::connection::Connection;
use crate::relay::{RelayError, SignalRelay};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Creates the offer; the controller in a pairing.
    Initiator,
    /// Answers the offer; the host that shows the session id.
    Responder,
}

impl Role {
    /// Store this role writes its local payload to.
    pub fn publishes(self) -> Direction {
        match self {
            Role::Initiator => Direction::Offer,
            Role::Responder => Direction::Answer,
        }
    }

    /// Store this role polls for the peer's payload.
    pub fn polls(self) -> Direction {
        match self {
            Role::Initiator => Direction::Answer,
            Role::Responder => Direction::Offer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingRemotePayload,
    Connected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    pub poll_interval: Duration,
    /// Give up if the channel is not open after this long; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("data channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] BackendError),
    #[error("negotiation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("negotiation task stopped unexpectedly: {0}")]
    Aborted(String),
}

/// Start negotiating `session` in the background.
pub fn negotiate<R, B>(
    relay: R,
    backend: B,
    session: SessionId,
    role: Role,
    config: NegotiationConfig,
) -> NegotiationHandle<B>
where
    R: SignalRelay,
    B: PeerBackend,
{
    let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
    let cancel = CancellationToken::new();
    let negotiation = Negotiation {
        relay: Arc::new(relay),
        channel: PeerChannel::new(backend),
        session: session.clone(),
        role,
        config,
        state: state_tx,
        known: KnownVersion::default(),
        unpublished: None,
        early_data: Vec::new(),
    };
    let task = tokio::spawn(negotiation.run(cancel.clone()));

    NegotiationHandle {
        session,
        role,
        state: state_rx,
        cancel,
        task,
    }
}

pub struct NegotiationHandle<B: PeerBackend> {
    session: SessionId,
    role: Role,
    state: watch::Receiver<NegotiationState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<Connection<B>, NegotiationError>>,
}

impl<B: PeerBackend> NegotiationHandle<B> {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Token that stops the negotiation when cancelled, e.g. from a signal handler.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the channel opens or negotiation fails.
    pub async fn connected(self) -> Result<Connection<B>, NegotiationError> {
        self.task
            .await
            .map_err(|err| NegotiationError::Aborted(err.to_string()))?
    }

    /// Stop negotiating. The relay is not touched once this returns.
    pub async fn cancel(self) -> Result<(), NegotiationError> {
        self.cancel.cancel();
        match self.connected().await {
            Ok(connection) => {
                connection.close().await;
                Ok(())
            }
            Err(NegotiationError::Cancelled) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

type RelayCall<T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send>>;

enum Flow {
    Continue,
    Publish(HandshakePayload),
    Connected,
}

struct Negotiation<R, B> {
    relay: Arc<R>,
    channel: PeerChannel<B>,
    session: SessionId,
    role: Role,
    config: NegotiationConfig,
    state: watch::Sender<NegotiationState>,
    known: KnownVersion,
    /// Local payload whose publish has not succeeded yet.
    unpublished: Option<HandshakePayload>,
    early_data: Vec<Bytes>,
}

impl<R: SignalRelay, B: PeerBackend> Negotiation<R, B> {
    async fn run(mut self, cancel: CancellationToken) -> Result<Connection<B>, NegotiationError> {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        info!(session = %self.session, role = %self.role, "starting negotiation");

        let outcome = match self.channel.start(self.role, events_tx).await {
            Ok(()) => {
                if self.role == Role::Responder {
                    self.set_state(NegotiationState::AwaitingRemotePayload);
                }
                self.drive(&cancel, &mut events).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                self.set_state(NegotiationState::Connected);
                info!(session = %self.session, role = %self.role, "data channel open");
                Ok(Connection::new(
                    self.session,
                    self.role,
                    self.channel,
                    events,
                    self.early_data,
                ))
            }
            Err(err) => {
                self.set_state(NegotiationState::Failed);
                match &err {
                    NegotiationError::Cancelled => {
                        info!(session = %self.session, role = %self.role, "negotiation cancelled")
                    }
                    err => {
                        warn!(session = %self.session, role = %self.role, error = %err, "negotiation failed")
                    }
                }
                self.channel.close().await;
                Err(err)
            }
        }
    }

    /// Loop until the channel opens or negotiation must stop. In-flight relay
    /// calls are dropped on return.
    async fn drive(
        &mut self,
        cancel: &CancellationToken,
        events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Result<(), NegotiationError> {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let limit = self.config.timeout;
        let deadline = async move {
            match limit {
                Some(limit) => sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut poll: Option<RelayCall<PollOutcome>> = None;
        let mut publish: Option<RelayCall<()>> = None;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(NegotiationError::Cancelled),

                _ = &mut deadline => {
                    return Err(NegotiationError::TimedOut(limit.unwrap_or_default()));
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        return Err(BackendError::ChannelClosed.into());
                    };
                    match self.on_event(event)? {
                        Flow::Connected => return Ok(()),
                        Flow::Publish(payload) => {
                            self.unpublished = Some(payload);
                            if publish.is_none() {
                                publish = self.publish_call();
                            }
                        }
                        Flow::Continue => {}
                    }
                }

                result = async {
                    match poll.as_mut() {
                        Some(call) => call.await,
                        None => std::future::pending().await,
                    }
                }, if poll.is_some() => {
                    poll = None;
                    self.on_poll(result).await?;
                }

                result = async {
                    match publish.as_mut() {
                        Some(call) => call.await,
                        None => std::future::pending().await,
                    }
                }, if publish.is_some() => {
                    publish = None;
                    self.on_published(result);
                }

                _ = ticker.tick() => {
                    if !self.is_polling() {
                        trace!(session = %self.session, "offer not published yet; not polling");
                    } else if poll.is_some() {
                        trace!(session = %self.session, "previous poll still in flight; skipping tick");
                    } else {
                        poll = Some(self.poll_call());
                    }
                    if publish.is_none() {
                        publish = self.publish_call();
                    }
                }
            }
        }
    }

    /// Responders poll from the start; initiators only once their offer is stored.
    fn is_polling(&self) -> bool {
        *self.state.borrow() == NegotiationState::AwaitingRemotePayload
    }

    fn poll_call(&self) -> RelayCall<PollOutcome> {
        let relay = Arc::clone(&self.relay);
        let session = self.session.clone();
        let direction = self.role.polls();
        let known = self.known;
        Box::pin(async move { relay.get(direction, &session, known).await })
    }

    fn publish_call(&self) -> Option<RelayCall<()>> {
        let payload = self.unpublished.clone()?;
        let relay = Arc::clone(&self.relay);
        let session = self.session.clone();
        let direction = self.role.publishes();
        Some(Box::pin(async move {
            relay.put(direction, &session, &payload).await
        }))
    }

    fn on_event(&mut self, event: PeerEvent) -> Result<Flow, NegotiationError> {
        match event {
            PeerEvent::LocalPayload(payload) => {
                Ok(match self.channel.accept_local(payload)? {
                    Some(payload) => {
                        debug!(
                            session = %self.session,
                            direction = %self.role.publishes(),
                            bytes = payload.len(),
                            "local payload ready"
                        );
                        Flow::Publish(payload)
                    }
                    None => Flow::Continue,
                })
            }
            PeerEvent::ChannelOpen => {
                if self.channel.mark_open() {
                    Ok(Flow::Connected)
                } else {
                    Ok(Flow::Continue)
                }
            }
            PeerEvent::Data(data) => {
                self.early_data.push(data);
                Ok(Flow::Continue)
            }
            PeerEvent::ChannelClosed => {
                self.channel.mark_finished();
                Err(BackendError::ChannelClosed.into())
            }
            PeerEvent::Error(err) => {
                self.channel.mark_finished();
                Err(err.into())
            }
        }
    }

    async fn on_poll(&mut self, result: Result<PollOutcome, RelayError>) -> Result<(), NegotiationError> {
        let direction = self.role.polls();
        match result {
            Ok(PollOutcome::Delivered { payload, version }) => {
                self.known.observe(version);
                debug!(session = %self.session, %direction, version, "remote payload delivered");
                if self.channel.apply_remote(payload).await? {
                    info!(session = %self.session, %direction, "applied remote payload");
                }
            }
            Ok(PollOutcome::NoUpdate) => {
                trace!(session = %self.session, %direction, known = self.known.get(), "no update");
            }
            Err(err) if err.is_not_found() => {
                trace!(session = %self.session, %direction, "peer has not published yet");
            }
            Err(err) => {
                warn!(session = %self.session, %direction, error = %err, "poll failed; retrying");
            }
        }
        Ok(())
    }

    fn on_published(&mut self, result: Result<(), RelayError>) {
        let direction = self.role.publishes();
        match result {
            Ok(()) => {
                self.unpublished = None;
                info!(session = %self.session, %direction, "published local payload");
                if self.role == Role::Initiator {
                    self.set_state(NegotiationState::AwaitingRemotePayload);
                }
            }
            Err(err) => {
                warn!(session = %self.session, %direction, error = %err, "publish failed; retrying");
            }
        }
    }

    fn set_state(&self, state: NegotiationState) {
        self.state.send_replace(state);
        debug!(session = %self.session, role = %self.role, ?state, "negotiation state");
    }
}
