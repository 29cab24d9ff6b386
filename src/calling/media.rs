//! Local and remote media streams.
//!
//! Capture itself lives behind [`MediaCapability`]; this module only models the
//! handles the controller owns and must release.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::CallType;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// A single capture or playback track.
///
/// Implementations use interior mutability: tracks are shared between the
/// controller and the peer connection that sends or receives them.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    /// Release the underlying device or receiver. Must be idempotent.
    fn stop(&self);
    fn is_stopped(&self) -> bool;
}

/// Requested capture resolution for video calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// What to capture for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` means no camera track.
    pub video: Option<VideoConstraints>,
}

impl MediaConstraints {
    pub fn for_call(call_type: CallType, video: &VideoConstraints) -> Self {
        Self {
            audio: true,
            video: call_type.wants_video().then(|| video.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device available: {0}")]
    Unavailable(String),
}

/// Source of local capture streams (camera/microphone).
#[async_trait]
pub trait MediaCapability: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream, MediaError>;
}

/// An exclusively owned set of tracks.
///
/// Dropping the stream stops every track, so a stream that is discarded on
/// any path (stale async result, failed negotiation, teardown) never keeps a
/// device open.
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    /// Add a track unless one with the same id is already present.
    pub fn push(&mut self, track: Arc<dyn MediaTrack>) {
        if self.tracks.iter().all(|t| t.id() != track.id()) {
            self.tracks.push(track);
        }
    }

    /// First track of the given kind.
    pub fn first_of(&self, kind: TrackKind) -> Option<&Arc<dyn MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            if !track.is_stopped() {
                track.stop();
                tracing::debug!("Stopped {} track {}", track.kind(), track.id());
            }
        }
    }

    /// Read-only snapshot for the presentation layer.
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            tracks: self
                .tracks
                .iter()
                .map(|t| TrackInfo {
                    id: t.id().to_string(),
                    kind: t.kind(),
                    enabled: t.is_enabled(),
                    stopped: t.is_stopped(),
                })
                .collect(),
        }
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub enabled: bool,
    pub stopped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
}

impl StreamInfo {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::sim::SimTrack;

    #[test]
    fn test_constraints_follow_call_type() {
        let video = VideoConstraints::default();
        let audio_only = MediaConstraints::for_call(CallType::Audio, &video);
        assert!(audio_only.audio);
        assert!(audio_only.video.is_none());

        let av = MediaConstraints::for_call(CallType::Video, &video);
        assert_eq!(
            av.video,
            Some(VideoConstraints {
                width: 640,
                height: 480
            })
        );
    }

    #[test]
    fn test_drop_stops_tracks() {
        let audio = SimTrack::new(TrackKind::Audio);
        let video = SimTrack::new(TrackKind::Video);
        let stream = MediaStream::new(
            "local",
            vec![audio.clone() as Arc<dyn MediaTrack>, video.clone()],
        );
        assert!(!audio.is_stopped());
        drop(stream);
        assert!(audio.is_stopped());
        assert!(video.is_stopped());
    }

    #[test]
    fn test_push_ignores_duplicate_track() {
        let track = SimTrack::new(TrackKind::Audio);
        let mut stream = MediaStream::new("remote", Vec::new());
        stream.push(track.clone());
        stream.push(track.clone());
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.first_of(TrackKind::Video).is_none());

        let info = stream.info();
        assert!(info.has(TrackKind::Audio));
        assert!(!info.tracks[0].stopped);
    }
}
