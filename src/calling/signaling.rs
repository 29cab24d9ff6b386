//! Call-control messages exchanged over the signaling channel.
//!
//! Outbound events are `call:initiate`, `call:accept`, `call:reject`,
//! `call:end` and `call:ice-candidate`; the server relays them to the far side
//! as `call:incoming`, `call:accepted`, `call:rejected`, `call:ended` and
//! `call:ice-candidate`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::{CallType, IceCandidate, SessionDescription};

pub const EVENT_INITIATE: &str = "call:initiate";
pub const EVENT_ACCEPT: &str = "call:accept";
pub const EVENT_REJECT: &str = "call:reject";
pub const EVENT_END: &str = "call:end";
pub const EVENT_ICE_CANDIDATE: &str = "call:ice-candidate";

pub const EVENT_INCOMING: &str = "call:incoming";
pub const EVENT_ACCEPTED: &str = "call:accepted";
pub const EVENT_REJECTED: &str = "call:rejected";
pub const EVENT_ENDED: &str = "call:ended";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("signaling channel is disconnected")]
    Disconnected,
}

/// Messages this side sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSignal {
    Initiate {
        to: String,
        from: String,
        offer: SessionDescription,
        call_type: CallType,
    },
    Accept {
        to: String,
        from: String,
        answer: SessionDescription,
    },
    Reject {
        to: String,
        from: String,
    },
    End {
        to: String,
        from: String,
    },
    IceCandidate {
        to: String,
        candidate: IceCandidate,
    },
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundSignal::Initiate { .. } => EVENT_INITIATE,
            OutboundSignal::Accept { .. } => EVENT_ACCEPT,
            OutboundSignal::Reject { .. } => EVENT_REJECT,
            OutboundSignal::End { .. } => EVENT_END,
            OutboundSignal::IceCandidate { .. } => EVENT_ICE_CANDIDATE,
        }
    }

    pub fn to(&self) -> &str {
        match self {
            OutboundSignal::Initiate { to, .. }
            | OutboundSignal::Accept { to, .. }
            | OutboundSignal::Reject { to, .. }
            | OutboundSignal::End { to, .. }
            | OutboundSignal::IceCandidate { to, .. } => to,
        }
    }

    /// JSON body of the event.
    pub fn payload(&self) -> Value {
        match self {
            OutboundSignal::Initiate {
                to,
                from,
                offer,
                call_type,
            } => serde_json::json!({
                "to": to,
                "from": from,
                "offer": offer,
                "callType": call_type,
            }),
            OutboundSignal::Accept { to, from, answer } => serde_json::json!({
                "to": to,
                "from": from,
                "answer": answer,
            }),
            OutboundSignal::Reject { to, from } | OutboundSignal::End { to, from } => {
                serde_json::json!({ "to": to, "from": from })
            }
            OutboundSignal::IceCandidate { to, candidate } => serde_json::json!({
                "to": to,
                "candidate": candidate,
            }),
        }
    }
}

/// Messages relayed to this side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundSignal {
    Incoming {
        from: String,
        offer: SessionDescription,
        call_type: CallType,
    },
    Accepted {
        from: Option<String>,
        answer: SessionDescription,
    },
    Rejected {
        from: Option<String>,
    },
    Ended {
        from: Option<String>,
    },
    IceCandidate {
        from: Option<String>,
        candidate: Option<IceCandidate>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingPayload {
    from: String,
    offer: SessionDescription,
    #[serde(default = "default_call_type")]
    call_type: CallType,
}

fn default_call_type() -> CallType {
    CallType::Video
}

#[derive(Deserialize)]
struct AcceptedPayload {
    #[serde(default)]
    from: Option<String>,
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct PartyPayload {
    #[serde(default)]
    from: Option<String>,
}

#[derive(Deserialize)]
struct CandidatePayload {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    candidate: Option<IceCandidate>,
}

fn decode<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, SignalingError> {
    serde_json::from_value(data).map_err(|source| SignalingError::Malformed {
        event: event.to_string(),
        source,
    })
}

impl InboundSignal {
    /// Parse a relayed event.
    ///
    /// Returns `Ok(None)` for events that are not call control (chat
    /// messages, presence and the like share the same channel).
    pub fn parse(event: &str, data: Value) -> Result<Option<Self>, SignalingError> {
        // Bodyless rejected/ended events arrive as null.
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };

        let signal = match event {
            EVENT_INCOMING => {
                let p: IncomingPayload = decode(event, data)?;
                InboundSignal::Incoming {
                    from: p.from,
                    offer: p.offer,
                    call_type: p.call_type,
                }
            }
            EVENT_ACCEPTED => {
                let p: AcceptedPayload = decode(event, data)?;
                InboundSignal::Accepted {
                    from: p.from,
                    answer: p.answer,
                }
            }
            EVENT_REJECTED => {
                let p: PartyPayload = decode(event, data)?;
                InboundSignal::Rejected { from: p.from }
            }
            EVENT_ENDED => {
                let p: PartyPayload = decode(event, data)?;
                InboundSignal::Ended { from: p.from }
            }
            EVENT_ICE_CANDIDATE => {
                let p: CandidatePayload = decode(event, data)?;
                InboundSignal::IceCandidate {
                    from: p.from,
                    candidate: p.candidate,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(signal))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundSignal::Incoming { .. } => "incoming",
            InboundSignal::Accepted { .. } => "accepted",
            InboundSignal::Rejected { .. } => "rejected",
            InboundSignal::Ended { .. } => "ended",
            InboundSignal::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// Sender, when the relay included it.
    pub fn from(&self) -> Option<&str> {
        match self {
            InboundSignal::Incoming { from, .. } => Some(from),
            InboundSignal::Accepted { from, .. }
            | InboundSignal::Rejected { from }
            | InboundSignal::Ended { from }
            | InboundSignal::IceCandidate { from, .. } => from.as_deref(),
        }
    }
}

/// Write side of the signaling channel.
///
/// Sends must preserve order: the far side relies on `call:initiate` arriving
/// before the candidates that follow it.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;
}
