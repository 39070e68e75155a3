//! Native capture devices.
//!
//! Microphone capture with cpal, encoded to Opus. The `cpal::Stream` is not
//! `Send`, so it lives on a blocking task that owns it until told to stop; the
//! track only keeps the control channel, the encoded frame feed and a window
//! of recent samples for level metering.
//! Camera and screen capture are not provided natively.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, StreamConfig};
use opus::{Application, Channels as OpusChannels, Encoder};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info};

use super::{
    CaptureHandle, EncodedFrame, LocalTrack, MediaDevices, MediaError, MediaRequest, TrackSource,
};

/// Audio configuration constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 1;
/// 20ms at 48kHz
pub const FRAME_SIZE: usize = 960;
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// Largest Opus packet we accept from the encoder.
const MAX_PACKET: usize = 4000;
/// Encoded frames buffered per subscriber (one second).
const FRAME_BACKLOG: usize = 50;
/// Samples kept for metering (100 ms).
const LEVEL_WINDOW: usize = SAMPLE_RATE as usize / 10;

/// Cuts PCM into 20ms Opus frames.
pub struct FrameEncoder {
    encoder: Encoder,
    pcm: Vec<f32>,
    packet: Vec<u8>,
}

impl FrameEncoder {
    pub fn new() -> Result<Self, MediaError> {
        let encoder = Encoder::new(SAMPLE_RATE, OpusChannels::Mono, Application::Voip)
            .map_err(|e| MediaError::Device(format!("opus encoder: {e}")))?;
        Ok(Self {
            encoder,
            pcm: Vec::with_capacity(FRAME_SIZE * 2),
            packet: vec![0; MAX_PACKET],
        })
    }

    /// Buffer `samples` and encode every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<EncodedFrame> {
        self.pcm.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pcm.len() >= FRAME_SIZE {
            let frame: Vec<i16> = self
                .pcm
                .drain(..FRAME_SIZE)
                .map(|s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
                .collect();

            match self.encoder.encode(&frame, &mut self.packet) {
                Ok(len) => frames.push(EncodedFrame {
                    data: self.packet[..len].to_vec(),
                    duration: FRAME_DURATION,
                }),
                Err(e) => error!("Opus encode error: {}", e),
            }
        }
        frames
    }
}

/// Control messages for capture task
enum CaptureControl {
    Stop,
}

/// Capture devices backed by the default cpal host.
#[derive(Debug, Default, Clone)]
pub struct NativeDevices;

impl NativeDevices {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaDevices for NativeDevices {
    async fn user_media(&self, request: MediaRequest) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        if request.video {
            return Err(MediaError::NoDevice("native camera capture unavailable".into()));
        }
        if !request.audio {
            return Ok(Vec::new());
        }

        let capture = CpalMicrophone::open().await?;
        Ok(vec![LocalTrack::new(
            TrackSource::Microphone,
            "Default microphone",
            capture,
        )])
    }

    async fn display_media(&self, _with_audio: bool) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        Err(MediaError::NotSupported)
    }
}

/// A running microphone capture.
struct CpalMicrophone {
    control: mpsc::Sender<CaptureControl>,
    window: Arc<Mutex<VecDeque<f32>>>,
    frames: broadcast::Sender<EncodedFrame>,
}

impl CpalMicrophone {
    async fn open() -> Result<Self, MediaError> {
        let window = Arc::new(Mutex::new(VecDeque::with_capacity(LEVEL_WINDOW)));
        let (frames, _) = broadcast::channel(FRAME_BACKLOG);
        let (control_tx, mut control_rx) = mpsc::channel::<CaptureControl>(1);
        let (ready_tx, ready_rx) = oneshot::channel();

        let task_window = window.clone();
        let task_frames = frames.clone();
        tokio::task::spawn_blocking(move || {
            run_capture_task(task_window, task_frames, ready_tx, &mut control_rx);
        });

        ready_rx
            .await
            .map_err(|_| MediaError::Device("capture task exited".into()))??;

        info!("Microphone capture started");
        Ok(Self {
            control: control_tx,
            window,
            frames,
        })
    }
}

impl CaptureHandle for CpalMicrophone {
    fn stop(&self) {
        if self.control.try_send(CaptureControl::Stop).is_ok() {
            debug!("Microphone capture stop requested");
        }
    }

    fn audio_samples(&self) -> Option<Vec<f32>> {
        self.window
            .lock()
            .ok()
            .map(|window| window.iter().copied().collect())
    }

    fn encoded_frames(&self) -> Option<broadcast::Receiver<EncodedFrame>> {
        Some(self.frames.subscribe())
    }
}

/// Run capture task (owns the Stream)
fn run_capture_task(
    window: Arc<Mutex<VecDeque<f32>>>,
    frames: broadcast::Sender<EncodedFrame>,
    ready_tx: oneshot::Sender<Result<(), MediaError>>,
    control_rx: &mut mpsc::Receiver<CaptureControl>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        let _ = ready_tx.send(Err(MediaError::NoDevice("no input device".into())));
        return;
    };

    let config = StreamConfig {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        buffer_size: BufferSize::Default,
    };

    let mut encoder = match FrameEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let window_clone = window.clone();
    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _| {
            if let Ok(mut window) = window_clone.lock() {
                window.extend(data.iter().copied());
                let excess = window.len().saturating_sub(LEVEL_WINDOW);
                window.drain(..excess);
            }
            for frame in encoder.push(data) {
                // No receivers until the first peer link binds the track.
                let _ = frames.send(frame);
            }
        },
        |err| {
            error!("Microphone stream error: {}", err);
        },
        None,
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(classify_build_error(&e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(MediaError::Device(e.to_string())));
        return;
    }

    if ready_tx.send(Ok(())).is_err() {
        // Requester went away before the device opened.
        return;
    }

    // Block until stop signal
    while let Some(msg) = control_rx.blocking_recv() {
        match msg {
            CaptureControl::Stop => break,
        }
    }

    drop(stream);
    if let Ok(mut window) = window.lock() {
        window.clear();
    }
    info!("Microphone capture stopped");
}

fn classify_build_error(err: &cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceInUse,
        cpal::BuildStreamError::StreamConfigNotSupported => {
            MediaError::NoDevice("input device rejected the stream config".into())
        }
        other => MediaError::Device(other.to_string()),
    }
}
