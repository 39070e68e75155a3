//! Voice Activity (speaking) Detection
//!
//! Samples the microphone track on a fixed interval and reports
//! speaking / not-speaking transitions with two-threshold hysteresis.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::config::SpeakingConfig;
use crate::media::LocalTrack;

/// Root-mean-square level of a block of samples.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|&s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Hysteresis state machine.
#[derive(Debug, Clone)]
pub struct SpeakingDetector {
    start_threshold: f32,
    stop_threshold: f32,
    speaking: bool,
}

impl SpeakingDetector {
    pub const fn new(config: &SpeakingConfig) -> Self {
        Self {
            start_threshold: config.start_threshold,
            stop_threshold: config.stop_threshold,
            speaking: false,
        }
    }

    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one reading. Returns `Some(new_state)` only on a transition.
    ///
    /// A muted microphone always reads as not speaking.
    pub fn update(&mut self, level: f32, mic_enabled: bool) -> Option<bool> {
        let next = if !mic_enabled {
            false
        } else if self.speaking {
            level >= self.stop_threshold
        } else {
            level > self.start_threshold
        };

        if next == self.speaking {
            None
        } else {
            self.speaking = next;
            Some(next)
        }
    }
}

/// Background sampler bound to one microphone track.
///
/// Aborted on drop.
#[derive(Debug)]
pub struct SpeakingMonitor {
    handle: JoinHandle<()>,
}

impl SpeakingMonitor {
    /// Start sampling `track`; each transition is passed to `on_change`.
    ///
    /// The task ends when the track stops or `on_change` returns false.
    pub fn spawn(
        track: Arc<LocalTrack>,
        config: SpeakingConfig,
        on_change: impl Fn(bool) -> bool + Send + 'static,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut detector = SpeakingDetector::new(&config);
            let mut ticker = interval(config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if track.is_stopped() {
                    break;
                }

                let level = track.audio_samples().map_or(0.0, |s| rms(&s));
                if let Some(speaking) = detector.update(level, track.is_enabled()) {
                    debug!(speaking, level, "Speaking state changed");
                    if !on_change(speaking) {
                        break;
                    }
                }
            }

            debug!(track_id = %track.id(), "Speaking monitor stopped");
        });

        Self { handle }
    }
}

impl Drop for SpeakingMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
