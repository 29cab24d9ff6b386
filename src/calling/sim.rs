//! In-process media and peer-connection backend.
//!
//! Generates synthetic SDP and host candidates and reports `connected` as
//! soon as both descriptions are installed. No packets are sent. The CLI uses
//! it to drive real signaling without a media stack; the tests use its
//! failure switches and acquisition gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::media::{
    MediaCapability, MediaConstraints, MediaError, MediaStream, MediaTrack, TrackKind,
};
use super::peer::{
    ConnectionState, PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSink,
    RtcConfig,
};
use super::{IceCandidate, SdpType, SessionDescription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A track with no device behind it.
#[derive(Debug)]
pub struct SimTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SimTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: format!("{}-{}", kind, &short_id()[..8]),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for SimTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Simulated camera/microphone.
#[derive(Default)]
pub struct SimMedia {
    failure: Option<String>,
    /// When set, every acquisition waits for a permit on this gate.
    gate: Option<Arc<Notify>>,
    acquired: Mutex<Vec<Arc<SimTrack>>>,
}

impl SimMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every acquisition fails with a permission error.
    #[cfg(test)]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Every track handed out so far.
    #[cfg(test)]
    pub fn acquired_tracks(&self) -> Vec<Arc<SimTrack>> {
        lock(&self.acquired).clone()
    }
}

#[async_trait]
impl MediaCapability for SimMedia {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(reason) = &self.failure {
            return Err(MediaError::PermissionDenied(reason.clone()));
        }

        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if let Some(video) = &constraints.video {
            tracing::debug!("Simulated camera at {}x{}", video.width, video.height);
            kinds.push(TrackKind::Video);
        }
        if kinds.is_empty() {
            return Err(MediaError::Unavailable("no tracks requested".into()));
        }

        let mut acquired = lock(&self.acquired);
        let tracks = kinds
            .into_iter()
            .map(|kind| {
                let track = SimTrack::new(kind);
                acquired.push(Arc::clone(&track));
                track as Arc<dyn MediaTrack>
            })
            .collect();
        Ok(MediaStream::new(format!("local-{}", &short_id()[..8]), tracks))
    }
}

/// Factory for [`SimPeer`]s.
#[derive(Default)]
pub struct SimPeerFactory {
    fail_negotiation: bool,
    created: Mutex<Vec<Arc<SimPeer>>>,
}

impl SimPeerFactory {
    /// Connections whose offer/answer creation always fails.
    #[cfg(test)]
    pub fn failing_negotiation() -> Self {
        Self {
            fail_negotiation: true,
            ..Self::default()
        }
    }

    /// Every connection created so far.
    #[cfg(test)]
    pub fn connections(&self) -> Vec<Arc<SimPeer>> {
        lock(&self.created).clone()
    }
}

impl PeerConnectionFactory for SimPeerFactory {
    fn create(
        &self,
        config: &RtcConfig,
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(SimPeer::new(events, self.fail_negotiation));
        tracing::debug!(
            "Created simulated peer connection {} ({} ICE servers)",
            pc.id,
            config.ice_servers.len()
        );
        lock(&self.created).push(Arc::clone(&pc));
        Ok(pc)
    }
}

struct SimPeerState {
    connection: ConnectionState,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
}

pub struct SimPeer {
    id: String,
    events: PeerEventSink,
    fail_negotiation: bool,
    state: Mutex<SimPeerState>,
}

impl SimPeer {
    fn new(events: PeerEventSink, fail_negotiation: bool) -> Self {
        Self {
            id: short_id()[..8].to_string(),
            events,
            fail_negotiation,
            state: Mutex::new(SimPeerState {
                connection: ConnectionState::New,
                local_tracks: Vec::new(),
                local: None,
                remote: None,
                remote_candidates: Vec::new(),
            }),
        }
    }

    #[cfg(test)]
    pub fn connection(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.connection() == ConnectionState::Closed
    }

    #[cfg(test)]
    pub fn local_track_count(&self) -> usize {
        lock(&self.state).local_tracks.len()
    }

    #[cfg(test)]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).remote_candidates.clone()
    }

    /// Push a connection-state change, as the transport would on ICE failure.
    #[cfg(test)]
    pub fn report(&self, connection: ConnectionState) {
        lock(&self.state).connection = connection;
        self.events.emit(PeerEvent::ConnectionState(connection));
    }

    fn open_state(&self) -> Result<MutexGuard<'_, SimPeerState>, PeerError> {
        let state = lock(&self.state);
        if state.connection == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(state)
    }

    /// Report `connected` once both descriptions are installed.
    fn maybe_connect(&self) {
        let connected = {
            let mut state = lock(&self.state);
            let ready = state.local.is_some() && state.remote.is_some();
            if ready && state.connection != ConnectionState::Connected {
                state.connection = ConnectionState::Connected;
                true
            } else {
                false
            }
        };
        if connected {
            self.events
                .emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        }
    }
}

fn synth_sdp(with_video: bool) -> String {
    let ufrag = &short_id()[..4];
    let pwd = short_id();

    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!("o=- {} 2 IN IP4 127.0.0.1\r\n", &short_id()[..12]));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(if with_video {
        "a=group:BUNDLE 0 1\r\n"
    } else {
        "a=group:BUNDLE 0\r\n"
    });

    sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n");
    sdp.push_str("c=IN IP4 0.0.0.0\r\n");
    sdp.push_str("a=mid:0\r\n");
    sdp.push_str(&format!("a=ice-ufrag:{}\r\n", ufrag));
    sdp.push_str(&format!("a=ice-pwd:{}\r\n", pwd));
    sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
    sdp.push_str("a=sendrecv\r\n");
    sdp.push_str("a=rtcp-mux\r\n");

    if with_video {
        sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str("a=mid:1\r\n");
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", pwd));
        sdp.push_str("a=rtpmap:96 VP8/90000\r\n");
        sdp.push_str("a=sendrecv\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
    }
    sdp
}

fn has_video(desc: &SessionDescription) -> bool {
    desc.sdp.contains("m=video")
}

#[async_trait]
impl PeerConnection for SimPeer {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.open_state()?.local_tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.open_state()?;
        if self.fail_negotiation {
            return Err(PeerError::Other("simulated offer failure".into()));
        }
        let with_video = state
            .local_tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Video);
        Ok(SessionDescription::offer(synth_sdp(with_video)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.open_state()?;
        if self.fail_negotiation {
            return Err(PeerError::Other("simulated answer failure".into()));
        }
        let remote = state
            .remote
            .as_ref()
            .ok_or_else(|| PeerError::InvalidDescription("no remote offer".into()))?;
        // Answer m-lines mirror the offer.
        Ok(SessionDescription::answer(synth_sdp(has_video(remote))))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        {
            let mut state = self.open_state()?;
            state.local = Some(desc);
            state.connection = ConnectionState::Connecting;
        }
        self.events.emit(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:1 1 UDP 2130706431 127.0.0.1 {} typ host",
                40000 + u16::from(self.id.as_bytes()[0])
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if !desc.sdp.starts_with("v=0") {
            return Err(PeerError::InvalidDescription(
                "missing version line".into(),
            ));
        }
        let mut kinds = vec![TrackKind::Audio];
        if has_video(&desc) {
            kinds.push(TrackKind::Video);
        }
        {
            let mut state = self.open_state()?;
            if desc.sdp_type == SdpType::Answer && state.local.is_none() {
                return Err(PeerError::InvalidDescription(
                    "answer without a local offer".into(),
                ));
            }
            state.remote = Some(desc);
        }
        for kind in kinds {
            self.events.emit(PeerEvent::RemoteTrack(SimTrack::new(kind)));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.open_state()?;
        if state.remote.is_none() {
            return Err(PeerError::InvalidCandidate(
                "no remote description".into(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::InvalidCandidate(candidate.candidate));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        if state.connection != ConnectionState::Closed {
            tracing::debug!("Closing simulated peer connection {}", self.id);
            state.connection = ConnectionState::Closed;
            state.local_tracks.clear();
        }
    }
}
