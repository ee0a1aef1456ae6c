//! Boundary to the media transport engine.
//!
//! The engine (`webrtc` crate) is an opaque capability provider: this
//! module exposes the five negotiation operations behind [`MediaSession`]
//! and funnels the engine's callbacks into an event channel so that all
//! session state is mutated from one task, never re-entrantly from an
//! engine thread.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use crate::config::CallConfig;
use crate::protocol::{CandidatePayload, SdpKind, SessionDescriptionPayload};

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media engine setup failed: {0}")]
    Setup(String),
    #[error("{op} failed: {reason}")]
    Operation { op: &'static str, reason: String },
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> MediaError {
    MediaError::Setup(err.to_string())
}

fn op_error<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> MediaError {
    move |err| MediaError::Operation {
        op,
        reason: err.to_string(),
    }
}

/// Subset of the engine's connection states the negotiation cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum EngineEventKind {
    LocalCandidate(CandidatePayload),
    ConnectionState(ConnectionState),
    RemoteTrack { kind: String, track_id: String },
}

/// Engine callback delivered as a message. `generation` names the peer
/// connection that produced it; events from a superseded connection are
/// discarded by the consumer.
#[derive(Debug)]
pub struct EngineEvent {
    pub generation: u64,
    pub kind: EngineEventKind,
}

/// The negotiation operations of one media session. Every operation is
/// fallible and asynchronously completed; `add_ice_candidate` is
/// at-least-once-safe (re-applying a candidate must not fault).
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescriptionPayload, MediaError>;
    async fn create_answer(&self) -> Result<SessionDescriptionPayload, MediaError>;
    async fn set_local_description(
        &self,
        desc: SessionDescriptionPayload,
    ) -> Result<(), MediaError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescriptionPayload,
    ) -> Result<(), MediaError>;
    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError>;
    async fn close(&self) -> Result<(), MediaError>;
}

fn build_api() -> Result<API, MediaError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn payload_from_description(
    desc: &RTCSessionDescription,
    op: &'static str,
) -> Result<SessionDescriptionPayload, MediaError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(MediaError::Operation {
                op,
                reason: format!("engine produced unexpected description type {other}"),
            });
        }
    };
    Ok(SessionDescriptionPayload {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn description_from_payload(
    payload: SessionDescriptionPayload,
    op: &'static str,
) -> Result<RTCSessionDescription, MediaError> {
    match payload.sdp_type {
        SdpKind::Offer => RTCSessionDescription::offer(payload.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(payload.sdp),
    }
    .map_err(op_error(op))
}

fn candidate_payload_from_engine(candidate: &RTCIceCandidate) -> Option<CandidatePayload> {
    match candidate.to_json() {
        Ok(json) => Some(CandidatePayload {
            candidate: json.candidate,
            sdp_mid: json.sdp_mid.unwrap_or_default(),
            sdp_mline_index: json.sdp_mline_index.unwrap_or_default(),
            username_fragment: json.username_fragment,
        }),
        Err(err) => {
            tracing::warn!(target = "media", error = %err, "failed to serialize local candidate");
            None
        }
    }
}

/// One `RTCPeerConnection`, exclusively owned by the session controller
/// and replaced wholesale on each fresh connect.
pub struct WebRtcMediaSession {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcMediaSession {
    pub async fn connect(
        config: &CallConfig,
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<Self>, MediaError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        // Recvonly transceivers before any offer is created, so the
        // description carries audio and video sections. Local capture is
        // attached by the host application, not here.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(to_setup_error)?;
        }

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => {
                        if let Some(payload) = candidate_payload_from_engine(&candidate) {
                            let _ = events.send(EngineEvent {
                                generation,
                                kind: EngineEventKind::LocalCandidate(payload),
                            });
                        }
                    }
                    None => {
                        tracing::debug!(target = "media", generation, "candidate gathering done");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "media", generation, ?state, "connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(state) = mapped {
                    let _ = events.send(EngineEvent {
                        generation,
                        kind: EngineEventKind::ConnectionState(state),
                    });
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let _ = events.send(EngineEvent {
                    generation,
                    kind: EngineEventKind::RemoteTrack {
                        kind: track.kind().to_string(),
                        track_id: track.id(),
                    },
                });
            })
        }));

        tracing::debug!(target = "media", generation, "peer connection created");
        Ok(Arc::new(Self { pc }))
    }
}

#[async_trait]
impl MediaSession for WebRtcMediaSession {
    async fn create_offer(&self) -> Result<SessionDescriptionPayload, MediaError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(op_error("create_offer"))?;
        payload_from_description(&offer, "create_offer")
    }

    async fn create_answer(&self) -> Result<SessionDescriptionPayload, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(op_error("create_answer"))?;
        payload_from_description(&answer, "create_answer")
    }

    async fn set_local_description(
        &self,
        desc: SessionDescriptionPayload,
    ) -> Result<(), MediaError> {
        let desc = description_from_payload(desc, "set_local_description")?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(op_error("set_local_description"))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescriptionPayload,
    ) -> Result<(), MediaError> {
        let desc = description_from_payload(desc, "set_remote_description")?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(op_error("set_remote_description"))
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(op_error("add_ice_candidate"))
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc.close().await.map_err(op_error("close"))
    }
}
