//! Call signaling and peer-connection lifecycle.
//!
//! The controller is the only owner of call resources (peer connection, local
//! and remote media). Everything else sees the read-only [`controller::CallView`].

pub mod controller;
pub mod machine;
pub mod media;
pub mod peer;
pub mod runner;
pub mod signaling;
pub mod sim;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Audio-only or audio+video. Fixed for the lifetime of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn wants_video(self) -> bool {
        self == CallType::Video
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallType::Audio => f.write_str("audio"),
            CallType::Video => f.write_str("video"),
        }
    }
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    /// We sent an offer and wait for the far side.
    Calling,
    /// The far side offered a call and we have not answered yet.
    Incoming,
    Connected,
    /// Teardown in progress. Never outlives one controller step.
    Ending,
}

impl CallState {
    pub fn is_idle(self) -> bool {
        self == CallState::Idle
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::Connected => "connected",
            CallState::Ending => "ending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description, serialized like `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, serialized like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

/// The one call in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub participant_id: String,
    pub is_initiator: bool,
    pub call_type: CallType,
    pub started_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(participant_id: impl Into<String>, is_initiator: bool, call_type: CallType) -> Self {
        Self {
            participant_id: participant_id.into(),
            is_initiator,
            call_type,
            started_at: Utc::now(),
        }
    }

    /// Whole seconds since the session was created.
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// User-visible notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    IncomingCall { from: String, call_type: CallType },
    CallRejected,
    CallEnded { duration_secs: i64 },
    Failed { message: String },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::IncomingCall { from, call_type } => {
                write!(f, "Incoming {} call from {}", call_type, from)
            }
            Notification::CallRejected => f.write_str("Call was rejected"),
            Notification::CallEnded { duration_secs } => write!(
                f,
                "Call ended ({:02}:{:02})",
                duration_secs / 60,
                duration_secs % 60
            ),
            Notification::Failed { message } => f.write_str(message),
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {action} while call is {state}")]
    InvalidState {
        action: &'static str,
        state: CallState,
    },
    #[error("call controller is not running")]
    ControllerClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_description_wire_format() {
        let offer = SessionDescription::offer("v=0\r\n");
        let json = serde_json::to_value(&offer).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0\r\n"}));
    }

    #[test]
    fn test_ice_candidate_wire_format() {
        let json = serde_json::json!({
            "candidate": "candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        });
        let c: IceCandidate = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_m_line_index, Some(0));
        assert_eq!(serde_json::to_value(&c).unwrap(), json);

        let bare: IceCandidate =
            serde_json::from_value(serde_json::json!({"candidate": "candidate:2"})).unwrap();
        assert!(bare.sdp_mid.is_none());
    }

    #[test]
    fn test_notification_text() {
        let n = Notification::CallEnded { duration_secs: 75 };
        assert_eq!(n.to_string(), "Call ended (01:15)");
        let n = Notification::IncomingCall {
            from: "alice".into(),
            call_type: CallType::Video,
        };
        assert_eq!(n.to_string(), "Incoming video call from alice");
    }

    #[test]
    fn test_invalid_state_message() {
        let e = CallError::InvalidState {
            action: "accept a call",
            state: CallState::Calling,
        };
        assert_eq!(e.to_string(), "cannot accept a call while call is calling");
    }
}
