//! Local media acquisition and ownership.
//!
//! The session controller owns exactly one [`LocalMedia`] while joined; the
//! registry shares its tracks (read-only) with every peer link. Capture
//! hardware and permission UI live outside this crate, behind the
//! [`MediaSource`] seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::CallError;

// ─── MediaSource ────────────────────────────────────────────────────────────

/// Provider of the local audio+video capture handle.
///
/// Acquisition is asynchronous (a real implementation waits on a permission
/// prompt or device open) and fallible — a denial aborts the join, it never
/// produces a partial handle.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, CallError>;
}

// ─── LocalMedia ─────────────────────────────────────────────────────────────

/// The local capture stream: one audio track, one video track.
///
/// The per-kind enable flags are the only mutable state. Whatever pumps
/// samples into the tracks consults them before writing, so a disabled kind
/// goes silent/black without renegotiation.
pub struct LocalMedia {
    audio: Arc<TrackLocalStaticSample>,
    video: Arc<TrackLocalStaticSample>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalMedia {
    pub fn new(audio: Arc<TrackLocalStaticSample>, video: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Both local tracks, for outbound attachment to a peer connection.
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        vec![
            Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&self.video) as Arc<dyn TrackLocal + Send + Sync>,
        ]
    }

    pub fn audio_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.audio
    }

    pub fn video_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.video
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Release the capture device.
    ///
    /// Idempotent — leave() calls this even when the tracks are already
    /// stopped. A stopped handle never produces samples again.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::Relaxed) {
            return;
        }
        self.set_audio_enabled(false);
        self.set_video_enabled(false);
        debug!("local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

// ─── SyntheticMediaSource ───────────────────────────────────────────────────

/// Device-less media source: Opus audio + VP8 video sample tracks with no
/// sample pump behind them. The default for embedders that feed tracks
/// themselves, and the fixture for tests.
#[derive(Debug, Default)]
pub struct SyntheticMediaSource {
    /// Stream id stamped on both tracks.
    pub stream_id: Option<String>,
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, CallError> {
        let stream_id = self.stream_id.clone().unwrap_or_else(|| "roomlink".to_string());
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            stream_id,
        ));
        Ok(LocalMedia::new(audio, video))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
