use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tether_core::{
    Delivery, Direction, ErrorBody, HandshakePayload, LocalIpResponse, PayloadError, PollBody,
    PutResponse, SessionId, StoreError,
};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::state::{AppState, StatsResponse};

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub id: Option<String>,
    pub version: Option<String>,
}

impl SignalQuery {
    fn session(&self) -> Result<SessionId, ApiError> {
        self.id
            .as_deref()
            .and_then(SessionId::parse)
            .ok_or(ApiError::MissingId)
    }

    /// Client-known version; absent or empty means `0`.
    fn known_version(&self) -> Result<u64, ApiError> {
        match self.version.as_deref().map(str::trim) {
            None | Some("") => Ok(0),
            Some(raw) => raw
                .parse()
                .map_err(|_| ApiError::InvalidVersion(raw.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing id parameter")]
    MissingId,
    #[error("version must be a non-negative integer, got `{0}`")]
    InvalidVersion(String),
    #[error(transparent)]
    NotFound(#[from] StoreError),
    #[error("failed to store {direction} payload: {source}")]
    InvalidPayload {
        direction: Direction,
        #[source]
        source: PayloadError,
    },
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingId
            | ApiError::InvalidVersion(_)
            | ApiError::InvalidPayload {
                source: PayloadError::Null,
                ..
            } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidPayload { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

pub async fn post_offer(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
    body: Bytes,
) -> Result<Json<PutResponse>, ApiError> {
    store_payload(&state, Direction::Offer, &query, body)
}

pub async fn get_offer(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
) -> Result<Json<PollBody>, ApiError> {
    poll_payload(&state, Direction::Offer, &query)
}

pub async fn post_answer(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
    body: Bytes,
) -> Result<Json<PutResponse>, ApiError> {
    store_payload(&state, Direction::Answer, &query, body)
}

pub async fn get_answer(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
) -> Result<Json<PollBody>, ApiError> {
    poll_payload(&state, Direction::Answer, &query)
}

fn store_payload(
    state: &AppState,
    direction: Direction,
    query: &SignalQuery,
    body: Bytes,
) -> Result<Json<PutResponse>, ApiError> {
    let session = query.session()?;
    let payload = HandshakePayload::from_json_bytes(body).map_err(|source| {
        error!(%direction, %session, error = %source, "rejected handshake payload");
        ApiError::InvalidPayload { direction, source }
    })?;
    let bytes = payload.len();

    let outcome = state.registry().store(direction).put(session.clone(), payload);
    counter!("tether_relay_puts_total", "direction" => direction.as_str()).increment(1);
    debug!(%direction, %session, bytes, ?outcome, "payload stored");

    Ok(Json(PutResponse { success: true }))
}

fn poll_payload(
    state: &AppState,
    direction: Direction,
    query: &SignalQuery,
) -> Result<Json<PollBody>, ApiError> {
    let session = query.session()?;
    let known_version = query.known_version()?;

    match state.registry().store(direction).get(&session, known_version) {
        Ok(Delivery::Payload { payload, version }) => {
            counter!("tether_relay_deliveries_total", "direction" => direction.as_str()).increment(1);
            Ok(Json(PollBody::delivered(payload, version)))
        }
        Ok(Delivery::NoUpdate) => {
            counter!("tether_relay_no_update_total", "direction" => direction.as_str()).increment(1);
            Ok(Json(PollBody::no_update()))
        }
        Err(err) => {
            counter!("tether_relay_not_found_total", "direction" => direction.as_str()).increment(1);
            Err(err.into())
        }
    }
}

pub async fn local_ip(State(state): State<AppState>) -> Response {
    let public_url = state.public_url().map(str::to_string);
    match lan_ipv4() {
        Ok(ip) => Json(LocalIpResponse {
            ip: ip.to_string(),
            public_url,
        })
        .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to list network interfaces");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(LocalIpResponse {
                    ip: Ipv4Addr::LOCALHOST.to_string(),
                    public_url,
                }),
            )
                .into_response()
        }
    }
}

/// First non-loopback IPv4 address of this machine, or `127.0.0.1`.
pub fn lan_ipv4() -> std::io::Result<Ipv4Addr> {
    let interfaces = if_addrs::get_if_addrs()?;
    Ok(interfaces
        .iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.stats())
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
