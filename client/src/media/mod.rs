//! Local Media
//!
//! Local capture tracks and the device seam that produces them.
//!
//! A [`LocalTrack`] is shared by reference: the same `Arc` is attached to the
//! outbound sender of every peer connection, so disabling or stopping it affects
//! all of them at once. Only the [`MediaController`] flips `enabled` or stops a track.

mod controller;
pub mod microphone;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

pub use controller::{LocalMedia, MediaController, ScreenCapture};
pub use microphone::NativeDevices;

/// Media errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied")]
    PermissionDenied,
    #[error("No capture device available: {0}")]
    NoDevice(String),
    #[error("Device is in use by another application")]
    DeviceInUse,
    #[error("Capture request cancelled by the user")]
    Cancelled,
    #[error("Capture not supported on this platform")]
    NotSupported,
    #[error("Device error: {0}")]
    Device(String),
}

/// The kind of media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// The source of a local track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenVideo,
    /// System audio captured alongside a screen share.
    ScreenAudio,
}

impl TrackSource {
    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone | Self::ScreenAudio => TrackKind::Audio,
            Self::Camera | Self::ScreenVideo => TrackKind::Video,
        }
    }
}

/// Device-side half of a track: releases the device and exposes raw samples.
pub trait CaptureHandle: Send + Sync {
    /// Release the underlying capture device.
    fn stop(&self);

    /// Most recent block of PCM samples in `[-1.0, 1.0]`, for audio sources.
    fn audio_samples(&self) -> Option<Vec<f32>> {
        None
    }

    /// Encoded frames as they are produced, for sources that encode.
    fn encoded_frames(&self) -> Option<broadcast::Receiver<EncodedFrame>> {
        None
    }
}

/// One encoded media frame, ready to be packetized.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// A captured local track.
pub struct LocalTrack {
    id: String,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    capture: Box<dyn CaptureHandle>,
}

impl LocalTrack {
    /// Wrap a capture handle. Tracks start enabled.
    pub fn new(
        source: TrackSource,
        label: impl Into<String>,
        capture: impl CaptureHandle + 'static,
    ) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::now_v7().to_string(),
            source,
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended,
            capture: Box::new(capture),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub const fn source(&self) -> TrackSource {
        self.source
    }

    pub const fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the track is still capturing.
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !*self.ended.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop capturing and release the device. Idempotent.
    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.capture.stop();
        }
    }

    /// Signal that capture ended outside our control (e.g. the OS "stop sharing" button).
    pub fn end(&self) {
        self.ended.send_replace(true);
    }

    pub fn subscribe_ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    pub fn audio_samples(&self) -> Option<Vec<f32>> {
        if self.is_stopped() {
            return None;
        }
        self.capture.audio_samples()
    }

    pub fn encoded_frames(&self) -> Option<broadcast::Receiver<EncodedFrame>> {
        if self.is_stopped() {
            return None;
        }
        self.capture.encoded_frames()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("label", &self.label)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// What a user-media request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaRequest {
    pub audio: bool,
    pub video: bool,
}

impl MediaRequest {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
    pub const VIDEO_ONLY: Self = Self {
        audio: false,
        video: true,
    };
}

/// Capture device access (microphone, camera, screen).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request microphone and/or camera tracks.
    async fn user_media(&self, request: MediaRequest) -> Result<Vec<Arc<LocalTrack>>, MediaError>;

    /// Request a screen capture: one video track and optionally a system-audio track.
    async fn display_media(&self, with_audio: bool) -> Result<Vec<Arc<LocalTrack>>, MediaError>;
}
