//! Peer connection abstraction.
//!
//! One [`PeerConnection`] exists per active call. It never calls back into the
//! controller directly: every event goes through a [`PeerEventSink`], which
//! queues it behind whatever the controller is currently doing.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::media::MediaTrack;
use super::{IceCandidate, SessionDescription};

/// Transport-level connection state, as reported by the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    // Only a real network transport loses connectivity; the simulated one
    // reports these from tests.
    #[allow(dead_code)]
    Disconnected,
    #[allow(dead_code)]
    Failed,
    Closed,
}

impl ConnectionState {
    /// The media path is gone and the call cannot continue.
    pub fn is_lost(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// A STUN/TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

/// Configuration handed to the factory for every new connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Events a peer connection reports asynchronously.
#[derive(Debug)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be sent to the far side.
    LocalCandidate(IceCandidate),
    /// A remote track arrived.
    RemoteTrack(Arc<dyn MediaTrack>),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid ICE candidate: {0}")]
    InvalidCandidate(String),
    #[error("{0}")]
    Other(String),
}

/// Where a peer connection delivers its events.
#[derive(Clone)]
pub struct PeerEventSink {
    inner: Arc<dyn Fn(PeerEvent) + Send + Sync>,
}

impl PeerEventSink {
    pub fn new(f: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: PeerEvent) {
        (self.inner)(event)
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerEventSink")
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Tear down the connection. Must be idempotent and never fail.
    fn close(&self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        config: &RtcConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// Caller side: create an offer and install it as the local description.
pub async fn negotiate_offer(pc: &dyn PeerConnection) -> Result<SessionDescription, PeerError> {
    let offer = pc.create_offer().await?;
    pc.set_local_description(offer.clone()).await?;
    Ok(offer)
}

/// Callee side: apply the remote offer, then create and install an answer.
pub async fn negotiate_answer(
    pc: &dyn PeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription, PeerError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer().await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer)
}
