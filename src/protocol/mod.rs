//! Wire codec for the signaling channel.
//!
//! Every message on the channel is a `SignalEnvelope`; its `data` field
//! carries a second JSON document whose schema is selected by the
//! envelope's `event` tag. Unknown tags are preserved as
//! [`SignalEvent::Other`] so the channel survives protocol additions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed signaling envelope: {0}")]
    Malformed(String),
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload { event: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalEvent {
    Offer,
    Answer,
    Candidate,
    Other(String),
}

impl SignalEvent {
    pub fn as_str(&self) -> &str {
        match self {
            SignalEvent::Offer => "offer",
            SignalEvent::Answer => "answer",
            SignalEvent::Candidate => "candidate",
            SignalEvent::Other(tag) => tag,
        }
    }
}

impl From<String> for SignalEvent {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "offer" => SignalEvent::Offer,
            "answer" => SignalEvent::Answer,
            "candidate" => SignalEvent::Candidate,
            _ => SignalEvent::Other(tag),
        }
    }
}

impl From<SignalEvent> for String {
    fn from(event: SignalEvent) -> Self {
        event.as_str().to_string()
    }
}

/// One signaling message. Immutable once constructed; `data` is the
/// payload document encoded as a string, exactly as it travels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub event: SignalEvent,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description produced by the media engine and round-tripped
/// through signaling verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptionPayload {
    #[serde(rename = "sdpType")]
    pub sdp_type: SdpKind,
    pub sdp: String,
}

/// One discovered network path, trickled individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl SignalEnvelope {
    pub fn description(
        user_name: &str,
        payload: &SessionDescriptionPayload,
    ) -> Result<Self, serde_json::Error> {
        Ok(SignalEnvelope {
            event: match payload.sdp_type {
                SdpKind::Offer => SignalEvent::Offer,
                SdpKind::Answer => SignalEvent::Answer,
            },
            user_name: user_name.to_string(),
            data: serde_json::to_string(payload)?,
        })
    }

    pub fn candidate(
        user_name: &str,
        payload: &CandidatePayload,
    ) -> Result<Self, serde_json::Error> {
        Ok(SignalEnvelope {
            event: SignalEvent::Candidate,
            user_name: user_name.to_string(),
            data: serde_json::to_string(payload)?,
        })
    }

    /// Parses the `data` field as a session description. Only meaningful
    /// when `event` is `Offer` or `Answer`.
    pub fn description_payload(&self) -> Result<SessionDescriptionPayload, DecodeError> {
        serde_json::from_str(&self.data).map_err(|err| DecodeError::InvalidPayload {
            event: self.event.as_str().to_string(),
            reason: err.to_string(),
        })
    }

    /// Parses the `data` field as an ICE candidate.
    pub fn candidate_payload(&self) -> Result<CandidatePayload, DecodeError> {
        serde_json::from_str(&self.data).map_err(|err| DecodeError::InvalidPayload {
            event: self.event.as_str().to_string(),
            reason: err.to_string(),
        })
    }
}

pub fn decode(text: &str) -> Result<SignalEnvelope, DecodeError> {
    serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))
}

pub fn encode(envelope: &SignalEnvelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}
