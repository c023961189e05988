//! [`PeerBackend`] over a real `RTCPeerConnection` with one ordered data channel.
//!
//! Negotiation is non-trickle: the offer or answer is only emitted after ICE
//! gathering completes, so a single payload per side carries every candidate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tether_core::HandshakePayload;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::adapter::{BackendError, PeerBackend, PeerEvent, PeerEvents};
use crate::negotiation::Role;

pub const CHANNEL_LABEL: &str = "tether";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN/TURN urls; empty means host candidates only.
    pub ice_servers: Vec<String>,
    pub gather_timeout: Duration,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            gather_timeout: GATHER_TIMEOUT,
        }
    }
}

/// Wire shape of an offer or answer: `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SdpPayload {
    #[serde(rename = "type")]
    pub typ: String,
    pub sdp: String,
}

pub struct WebRtcBackend {
    config: WebRtcConfig,
    setting: Option<SettingEngine>,
    pc: Option<Arc<RTCPeerConnection>>,
    channel: Arc<AsyncMutex<Option<Arc<RTCDataChannel>>>>,
    events: Option<PeerEvents>,
    role: Option<Role>,
}

impl WebRtcBackend {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            setting: None,
            pc: None,
            channel: Arc::new(AsyncMutex::new(None)),
            events: None,
            role: None,
        }
    }

    /// Use a custom setting engine, e.g. one bound to a virtual network.
    pub fn with_setting_engine(mut self, setting: SettingEngine) -> Self {
        self.setting = Some(setting);
        self
    }

    fn peer(&self) -> Result<&Arc<RTCPeerConnection>, BackendError> {
        self.pc
            .as_ref()
            .ok_or_else(|| BackendError::Setup("peer connection not started".into()))
    }
}

#[async_trait]
impl PeerBackend for WebRtcBackend {
    async fn start(&mut self, role: Role, events: PeerEvents) -> Result<(), BackendError> {
        let api = build_api(self.setting.take().unwrap_or_default())?;
        let rtc_config = RTCConfiguration {
            ice_servers: if self.config.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.config.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target: "webrtc", ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send(PeerEvent::Error(BackendError::Setup(
                        "peer connection failed".into(),
                    )));
                }
            })
        }));

        match role {
            Role::Initiator => {
                let dc_init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(CHANNEL_LABEL, Some(dc_init))
                    .await
                    .map_err(to_setup_error)?;
                wire_channel(&dc, events.clone());
                self.channel.lock().await.replace(dc);

                let offer = pc.create_offer(None).await.map_err(to_setup_error)?;
                pc.set_local_description(offer)
                    .await
                    .map_err(to_setup_error)?;
                let payload = gathered_payload(&pc, self.config.gather_timeout).await?;
                let _ = events.send(PeerEvent::LocalPayload(payload));
            }
            Role::Responder => {
                let holder = Arc::clone(&self.channel);
                let channel_events = events.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let holder = Arc::clone(&holder);
                    let events = channel_events.clone();
                    Box::pin(async move {
                        if dc.label() != CHANNEL_LABEL {
                            tracing::warn!(target: "webrtc", label = dc.label(), "ignoring unexpected data channel");
                            return;
                        }
                        wire_channel(&dc, events);
                        holder.lock().await.replace(dc);
                    })
                }));
            }
        }

        self.pc = Some(pc);
        self.events = Some(events);
        self.role = Some(role);
        Ok(())
    }

    async fn apply_remote(&mut self, payload: HandshakePayload) -> Result<(), BackendError> {
        let pc = Arc::clone(self.peer()?);
        let remote: SdpPayload = payload
            .decode()
            .map_err(|err| BackendError::Setup(err.to_string()))?;
        let description = session_description_from_payload(&remote)?;
        pc.set_remote_description(description)
            .await
            .map_err(to_setup_error)?;

        if self.role == Some(Role::Responder) {
            let events = self
                .events
                .clone()
                .ok_or_else(|| BackendError::Setup("backend not started".into()))?;
            let gather_timeout = self.config.gather_timeout;
            tokio::spawn(async move {
                let event = match answer(&pc, gather_timeout).await {
                    Ok(payload) => PeerEvent::LocalPayload(payload),
                    Err(err) => PeerEvent::Error(err),
                };
                let _ = events.send(event);
            });
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<(), BackendError> {
        let guard = self.channel.lock().await;
        let dc = guard.as_ref().ok_or(BackendError::ChannelClosed)?;
        let written = dc.send(&data).await.map_err(to_setup_error)?;
        tracing::trace!(target: "webrtc", bytes_written = written, "sent frame");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(dc) = self.channel.lock().await.take() {
            let _ = dc.close().await;
        }
        if let Some(pc) = self.pc.take() {
            if let Err(err) = pc.close().await {
                tracing::debug!(target: "webrtc", error = %err, "error closing peer connection");
            }
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, BackendError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: PeerEvents) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            tracing::debug!(target: "webrtc", "data channel open");
            let _ = events.send(PeerEvent::ChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            tracing::trace!(target: "webrtc", frame_len = msg.data.len(), "received frame");
            let _ = events.send(PeerEvent::Data(msg.data));
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            tracing::warn!(target: "webrtc", error = %err, "data channel error");
            let _ = events.send(PeerEvent::Error(BackendError::Setup(err.to_string())));
        })
    }));

    dc.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            tracing::debug!(target: "webrtc", "data channel closed");
            let _ = events.send(PeerEvent::ChannelClosed);
        })
    }));
}

async fn answer(
    pc: &Arc<RTCPeerConnection>,
    gather_timeout: Duration,
) -> Result<HandshakePayload, BackendError> {
    let answer = pc.create_answer(None).await.map_err(to_setup_error)?;
    pc.set_local_description(answer)
        .await
        .map_err(to_setup_error)?;
    gathered_payload(pc, gather_timeout).await
}

/// Wait for ICE gathering to finish and return the complete local description.
async fn gathered_payload(
    pc: &Arc<RTCPeerConnection>,
    gather_timeout: Duration,
) -> Result<HandshakePayload, BackendError> {
    let mut gather = pc.gathering_complete_promise().await;
    timeout(gather_timeout, gather.recv())
        .await
        .map_err(|_| BackendError::Timeout)?;

    let description = pc
        .local_description()
        .await
        .ok_or_else(|| BackendError::Setup("failed to obtain local description".into()))?;
    HandshakePayload::from_value(&payload_from_description(&description))
        .map_err(|err| BackendError::Setup(err.to_string()))
}

fn payload_from_description(desc: &RTCSessionDescription) -> SdpPayload {
    SdpPayload {
        typ: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

fn session_description_from_payload(
    payload: &SdpPayload,
) -> Result<RTCSessionDescription, BackendError> {
    let description = match RTCSdpType::from(payload.typ.as_str()) {
        RTCSdpType::Offer => RTCSessionDescription::offer(payload.sdp.clone()),
        RTCSdpType::Answer => RTCSessionDescription::answer(payload.sdp.clone()),
        RTCSdpType::Pranswer => RTCSessionDescription::pranswer(payload.sdp.clone()),
        RTCSdpType::Rollback | RTCSdpType::Unspecified => {
            return Err(BackendError::Setup(format!(
                "unsupported sdp type {}",
                payload.typ
            )));
        }
    };
    description.map_err(to_setup_error)
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> BackendError {
    BackendError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn sdp_payload_uses_browser_field_names() {
        let payload = SdpPayload {
            typ: "offer".into(),
            sdp: "v=0".into(),
        };
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"type":"offer","sdp":"v=0"}"#
        );
    }

    #[test_timeout::timeout]
    fn rejects_unsupported_sdp_types() {
        let payload = SdpPayload {
            typ: "rollback".into(),
            sdp: String::new(),
        };
        assert!(session_description_from_payload(&payload).is_err());
    }
}
