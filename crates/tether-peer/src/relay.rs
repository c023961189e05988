//! Clients for the relay's two direction stores.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tether_core::{
    Delivery, Direction, ErrorBody, HandshakePayload, KnownVersion, PollBody, PollOutcome,
    SessionId, SessionRegistry, StoreError, WireError,
};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Nothing published yet for this session and direction.
    #[error("no {direction} published for session {session}")]
    NotFound {
        direction: Direction,
        session: SessionId,
    },
    #[error("relay rejected the request: {0}")]
    MissingParameter(String),
    #[error("relay failed with status {status}: {message}")]
    Store { status: u16, message: String },
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed relay response: {0}")]
    Wire(#[from] WireError),
    #[error("invalid relay url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl RelayError {
    /// Whether this is the expected "peer has not published yet" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound { .. })
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { direction, session } => RelayError::NotFound { direction, session },
        }
    }
}

/// Where handshake payloads are parked while the peers find each other.
#[async_trait]
pub trait SignalRelay: Send + Sync + 'static {
    async fn put(
        &self,
        direction: Direction,
        session: &SessionId,
        payload: &HandshakePayload,
    ) -> Result<(), RelayError>;

    async fn get(
        &self,
        direction: Direction,
        session: &SessionId,
        known: KnownVersion,
    ) -> Result<PollOutcome, RelayError>;
}

/// Upper bound on one relay request; a hung request fails and the poller
/// retries on its next tick.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(8);

/// Talks to a `tether-relay` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    client: Client,
    base: String,
}

impl HttpRelay {
    pub fn new(base: &str) -> Result<Self, RelayError> {
        Self::with_timeout(base, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, RelayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Self::with_client(client, base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self, RelayError> {
        let parsed = Url::parse(base).map_err(|source| RelayError::InvalidUrl {
            url: base.to_string(),
            source,
        })?;
        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    /// Absolute url of `path` (which starts with `/`) on this relay.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn endpoint(&self, direction: Direction) -> String {
        self.url(direction.path())
    }
}

#[async_trait]
impl SignalRelay for HttpRelay {
    async fn put(
        &self,
        direction: Direction,
        session: &SessionId,
        payload: &HandshakePayload,
    ) -> Result<(), RelayError> {
        let url = self.endpoint(direction);
        let response = self
            .client
            .post(url)
            .query(&[("id", session.as_str())])
            .header(CONTENT_TYPE, "application/json")
            .body(payload.as_bytes().to_vec())
            .send()
            .await?;
        tracing::trace!(
            target: "tether::relay",
            %direction,
            %session,
            status = %response.status(),
            "publish response"
        );

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(direction, session, response).await)
        }
    }

    async fn get(
        &self,
        direction: Direction,
        session: &SessionId,
        known: KnownVersion,
    ) -> Result<PollOutcome, RelayError> {
        let url = self.endpoint(direction);
        let version = known.get().to_string();
        let response = self
            .client
            .get(url)
            .query(&[("id", session.as_str()), ("version", version.as_str())])
            .send()
            .await?;
        tracing::trace!(
            target: "tether::relay",
            %direction,
            %session,
            known = known.get(),
            status = %response.status(),
            "poll response"
        );

        match response.status() {
            StatusCode::OK => {
                let body: PollBody = response.json().await?;
                Ok(body.into_outcome()?)
            }
            _ => Err(error_from_response(direction, session, response).await),
        }
    }
}

async fn error_from_response(
    direction: Direction,
    session: &SessionId,
    response: reqwest::Response,
) -> RelayError {
    let status = response.status();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
    };
    match status {
        StatusCode::NOT_FOUND => RelayError::NotFound {
            direction,
            session: session.clone(),
        },
        StatusCode::BAD_REQUEST => RelayError::MissingParameter(message),
        status => RelayError::Store {
            status: status.as_u16(),
            message,
        },
    }
}

/// In-process relay over a shared registry; both peers in one process.
#[derive(Debug, Clone, Default)]
pub struct LocalRelay {
    registry: SessionRegistry,
}

impl LocalRelay {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

#[async_trait]
impl SignalRelay for LocalRelay {
    async fn put(
        &self,
        direction: Direction,
        session: &SessionId,
        payload: &HandshakePayload,
    ) -> Result<(), RelayError> {
        self.registry
            .store(direction)
            .put(session.clone(), payload.clone());
        Ok(())
    }

    async fn get(
        &self,
        direction: Direction,
        session: &SessionId,
        known: KnownVersion,
    ) -> Result<PollOutcome, RelayError> {
        match self.registry.store(direction).get(session, known.get())? {
            Delivery::Payload { payload, version } => Ok(PollOutcome::Delivered { payload, version }),
            Delivery::NoUpdate => Ok(PollOutcome::NoUpdate),
        }
    }
}

#[async_trait]
impl<R: SignalRelay + ?Sized> SignalRelay for std::sync::Arc<R> {
    async fn put(
        &self,
        direction: Direction,
        session: &SessionId,
        payload: &HandshakePayload,
    ) -> Result<(), RelayError> {
        (**self).put(direction, session, payload).await
    }

    async fn get(
        &self,
        direction: Direction,
        session: &SessionId,
        known: KnownVersion,
    ) -> Result<PollOutcome, RelayError> {
        (**self).get(direction, session, known).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_relay_follows_store_semantics() {
        let relay = LocalRelay::default();
        let err = relay
            .get(Direction::Offer, &id("s"), KnownVersion::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let payload = HandshakePayload::from_value(&json!({ "type": "offer" })).unwrap();
        relay.put(Direction::Offer, &id("s"), &payload).await.unwrap();

        let mut known = KnownVersion::default();
        match relay.get(Direction::Offer, &id("s"), known).await.unwrap() {
            PollOutcome::Delivered { payload: got, version } => {
                assert_eq!(got, payload);
                assert!(known.observe(version));
            }
            PollOutcome::NoUpdate => panic!("first poll must deliver"),
        }
        assert_eq!(
            relay.get(Direction::Offer, &id("s"), known).await.unwrap(),
            PollOutcome::NoUpdate
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_relay_shares_a_caller_registry() {
        let registry = SessionRegistry::new(tether_core::StoreConfig::default());
        let relay = LocalRelay::new(registry.clone());
        let payload = HandshakePayload::from_value(&json!({ "type": "answer" })).unwrap();
        relay.put(Direction::Answer, &id("s"), &payload).await.unwrap();

        assert_eq!(relay.registry().store(Direction::Answer).len(), 1);
        assert!(registry.store(Direction::Offer).is_empty());
        assert!(matches!(
            registry.store(Direction::Answer).get(&id("s"), 0),
            Ok(Delivery::Payload { version: 1, .. })
        ));
    }

    #[test_timeout::timeout]
    fn http_relay_normalises_base_url() {
        let relay = HttpRelay::new("http://localhost:3000/").unwrap();
        assert_eq!(relay.endpoint(Direction::Answer), "http://localhost:3000/api/answer");
        let nested = HttpRelay::new("https://example.com/tether").unwrap();
        assert_eq!(nested.url("/api/local-ip"), "https://example.com/tether/api/local-ip");
        assert!(matches!(
            HttpRelay::new("not a url"),
            Err(RelayError::InvalidUrl { .. })
        ));
    }
}
