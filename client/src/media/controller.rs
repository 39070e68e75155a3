//! Local media state for one active session.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{LocalTrack, MediaDevices, MediaError, MediaRequest, TrackKind};

/// Tracks obtained by the initial acquisition.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub microphone: Arc<LocalTrack>,
    /// `None` when only audio could be captured.
    pub camera: Option<Arc<LocalTrack>>,
}

impl LocalMedia {
    /// Stop every track; used when an acquisition result arrives too late.
    pub fn release(&self) {
        self.microphone.stop();
        if let Some(camera) = &self.camera {
            camera.stop();
        }
    }
}

/// Tracks obtained by a screen-capture request.
#[derive(Debug, Clone)]
pub struct ScreenCapture {
    pub video: Arc<LocalTrack>,
    pub audio: Option<Arc<LocalTrack>>,
}

impl ScreenCapture {
    pub fn release(&self) {
        self.video.stop();
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

/// Owns the local tracks of a session and is their only mutator.
#[derive(Debug)]
pub struct MediaController {
    microphone: Option<Arc<LocalTrack>>,
    camera: Option<Arc<LocalTrack>>,
    screen: Option<ScreenCapture>,
}

impl MediaController {
    /// Request audio+video, falling back to audio-only.
    ///
    /// The camera track comes back disabled so switching it on later does not
    /// touch the device again.
    pub async fn acquire_local_media(devices: &dyn MediaDevices) -> Result<LocalMedia, MediaError> {
        let tracks = match devices.user_media(MediaRequest::AUDIO_VIDEO).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "Audio+video capture failed, retrying audio-only");
                devices.user_media(MediaRequest::AUDIO_ONLY).await?
            }
        };

        let media = Self::split_user_media(tracks)?;
        if let Some(camera) = &media.camera {
            camera.set_enabled(false);
        }

        info!(
            microphone = %media.microphone.label(),
            camera = media.camera.as_ref().map_or("none", |c| c.label()),
            "Local media acquired"
        );
        Ok(media)
    }

    /// Request a camera track on its own, for sessions that joined audio-only.
    pub async fn acquire_camera(devices: &dyn MediaDevices) -> Result<Arc<LocalTrack>, MediaError> {
        let tracks = devices.user_media(MediaRequest::VIDEO_ONLY).await?;
        let mut camera = None;
        for track in tracks {
            if track.kind() == TrackKind::Video && camera.is_none() {
                camera = Some(track);
            } else {
                track.stop();
            }
        }
        camera.ok_or_else(|| MediaError::NoDevice("no camera track returned".into()))
    }

    /// Ask the OS for a screen capture.
    pub async fn request_screen(
        devices: &dyn MediaDevices,
        with_audio: bool,
    ) -> Result<ScreenCapture, MediaError> {
        let tracks = devices.display_media(with_audio).await?;

        let mut video = None;
        let mut audio = None;
        for track in tracks {
            match track.kind() {
                TrackKind::Video if video.is_none() => video = Some(track),
                TrackKind::Audio if audio.is_none() && with_audio => audio = Some(track),
                _ => track.stop(),
            }
        }

        match video {
            Some(video) => Ok(ScreenCapture { video, audio }),
            None => {
                if let Some(audio) = audio {
                    audio.stop();
                }
                Err(MediaError::NoDevice("no screen video track returned".into()))
            }
        }
    }

    fn split_user_media(tracks: Vec<Arc<LocalTrack>>) -> Result<LocalMedia, MediaError> {
        let mut microphone = None;
        let mut camera = None;

        for track in tracks {
            match track.kind() {
                TrackKind::Audio if microphone.is_none() => microphone = Some(track),
                TrackKind::Video if camera.is_none() => camera = Some(track),
                _ => track.stop(),
            }
        }

        match microphone {
            Some(microphone) => Ok(LocalMedia { microphone, camera }),
            None => {
                if let Some(camera) = camera {
                    camera.stop();
                }
                Err(MediaError::NoDevice("no microphone track returned".into()))
            }
        }
    }

    /// Controller over freshly acquired media. The microphone starts enabled.
    pub fn new(media: LocalMedia) -> Self {
        media.microphone.set_enabled(true);
        Self {
            microphone: Some(media.microphone),
            camera: media.camera,
            screen: None,
        }
    }

    pub fn microphone(&self) -> Option<&Arc<LocalTrack>> {
        self.microphone.as_ref()
    }

    pub fn camera(&self) -> Option<&Arc<LocalTrack>> {
        self.camera.as_ref()
    }

    pub fn mic_on(&self) -> bool {
        self.microphone.as_ref().is_some_and(|t| t.is_enabled())
    }

    pub fn cam_on(&self) -> bool {
        self.camera.as_ref().is_some_and(|t| t.is_enabled())
    }

    pub const fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }

    pub fn set_mic_enabled(&self, enabled: bool) {
        if let Some(mic) = &self.microphone {
            mic.set_enabled(enabled);
            debug!(enabled, "Microphone enabled state changed");
        }
    }

    /// Returns false when there is no camera track to toggle.
    pub fn set_camera_enabled(&self, enabled: bool) -> bool {
        match &self.camera {
            Some(camera) => {
                camera.set_enabled(enabled);
                debug!(enabled, "Camera enabled state changed");
                true
            }
            None => false,
        }
    }

    /// Install a lazily acquired camera track.
    pub fn install_camera(&mut self, camera: Arc<LocalTrack>) {
        if let Some(old) = self.camera.replace(camera) {
            old.stop();
        }
    }

    /// The track every link's audio sender carries.
    pub fn outbound_audio(&self) -> Option<Arc<LocalTrack>> {
        self.microphone.clone()
    }

    /// The track every link's video sender carries: the screen while sharing,
    /// otherwise the camera (disabled when the camera is off).
    pub fn outbound_video(&self) -> Option<Arc<LocalTrack>> {
        match &self.screen {
            Some(screen) => Some(screen.video.clone()),
            None => self.camera.clone(),
        }
    }

    /// Make a screen capture the active video source. Returns the new outbound video.
    pub fn start_screen_share(&mut self, capture: ScreenCapture) -> Arc<LocalTrack> {
        if let Some(previous) = self.screen.take() {
            previous.release();
        }
        let video = capture.video.clone();
        self.screen = Some(capture);
        info!(track_id = %video.id(), "Screen share started");
        video
    }

    /// Stop the screen capture. Returns false if nothing was being shared.
    pub fn stop_screen_share(&mut self) -> bool {
        match self.screen.take() {
            Some(capture) => {
                capture.release();
                info!("Screen share stopped");
                true
            }
            None => false,
        }
    }

    /// Whether `track_id` is the current screen video.
    pub fn is_current_screen(&self, track_id: &str) -> bool {
        self.screen
            .as_ref()
            .is_some_and(|s| s.video.id() == track_id)
    }

    /// Stop every track and drop all references to them.
    pub fn release_all(&mut self) {
        self.stop_screen_share();
        for track in [self.microphone.take(), self.camera.take()].into_iter().flatten() {
            track.stop();
        }
        debug!("All local media released");
    }

    /// Every track that is still held, for diagnostics.
    pub fn tracks(&self) -> Vec<Arc<LocalTrack>> {
        let mut tracks: Vec<Arc<LocalTrack>> = Vec::new();
        tracks.extend(self.microphone.iter().cloned());
        tracks.extend(self.camera.iter().cloned());
        if let Some(screen) = &self.screen {
            tracks.push(screen.video.clone());
            tracks.extend(screen.audio.iter().cloned());
        }
        tracks
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release_all();
    }
}
