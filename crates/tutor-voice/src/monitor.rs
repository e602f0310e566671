//! Voice activity monitor: gap logic over the microphone stream.
//!
//! Each listening episode ends with exactly one of
//! [`MonitorEvent::UtteranceFinalized`] (trailing silence reached the
//! threshold, or speech ran up to the pause threshold) or
//! [`MonitorEvent::ListeningTimedOut`] (no speech within the window). While the
//! tutor is speaking the monitor only watches for
//! [`MonitorEvent::SpeechOnsetDetected`]. It reports observations; the
//! scheduler decides what happens next.
//!
//! All durations are measured on the audio clock (buffer lengths), not wall time.

use crate::audio::{AudioChunk, AudioSpan};
use crate::vad::{EnergyClassifier, SpeechClassifier};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info};
use tutor_core::VoiceLoopConfig;

/// Speech shorter than this, followed by silence, is treated as a click or cough.
pub const MIN_UTTERANCE: Duration = Duration::from_millis(150);

/// Continuous speech needed while the tutor talks before it counts as barge-in.
pub const ONSET_MIN_SPEECH: Duration = Duration::from_millis(60);

/// Timing and detection settings for the monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Trailing silence that ends an utterance
    pub silence_threshold: Duration,

    /// Longest speech before the utterance is cut and finalized anyway
    pub pause_threshold: Duration,

    /// Window for speech to start before listening gives up
    pub listening_timeout: Duration,

    pub sensitivity: f32,

    pub noise_reduction: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig::from(&VoiceLoopConfig::default())
    }
}

impl From<&VoiceLoopConfig> for MonitorConfig {
    fn from(c: &VoiceLoopConfig) -> Self {
        Self {
            silence_threshold: c.silence_threshold,
            pause_threshold: c.pause_threshold,
            listening_timeout: c.listening_timeout,
            sensitivity: c.voice_detection_sensitivity,
            noise_reduction: c.background_noise_reduction,
        }
    }
}

/// What the monitor is currently doing with incoming buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Buffers are dropped.
    Dormant,
    /// A listening episode is running.
    Listening,
    /// The tutor is speaking; only speech onset is reported.
    WatchingForOnset,
}

/// Observations reported to the scheduler
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Learner started speaking in this episode
    SpeechStarted,

    /// Learner is still speaking (at most once per second of speech)
    SpeechOngoing { speech: Duration },

    /// The utterance is complete and ready for recognition
    UtteranceFinalized(AudioSpan),

    /// No speech started within the listening window
    ListeningTimedOut,

    /// Learner speech detected while the tutor was speaking
    SpeechOnsetDetected,
}

/// Progress inside one listening episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Speaking,
    TrailingSilence,
}

/// Tracks speech and silence durations and turns them into episode events.
pub struct VoiceActivityMonitor {
    config: MonitorConfig,
    classifier: Box<dyn SpeechClassifier>,
    mode: MonitorMode,
    phase: Phase,

    // Audio-clock timing
    elapsed: Duration,
    speech: Duration,
    silence: Duration,
    ticks: u64,

    sample_rate: u32,
    buffer: Vec<f32>,
}

impl VoiceActivityMonitor {
    /// Monitor with the default energy classifier.
    pub fn new(config: MonitorConfig) -> Self {
        let classifier = EnergyClassifier::new(config.sensitivity, config.noise_reduction);
        Self::with_classifier(config, Box::new(classifier))
    }

    pub fn with_classifier(config: MonitorConfig, classifier: Box<dyn SpeechClassifier>) -> Self {
        Self {
            config,
            classifier,
            mode: MonitorMode::Dormant,
            phase: Phase::Waiting,
            elapsed: Duration::ZERO,
            speech: Duration::ZERO,
            silence: Duration::ZERO,
            ticks: 0,
            sample_rate: 0,
            buffer: Vec::new(),
        }
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    /// Start a fresh listening episode.
    pub fn listen(&mut self) {
        self.clear();
        self.mode = MonitorMode::Listening;
    }

    /// Start listening with the speech heard while watching for onset kept as
    /// the start of the utterance.
    pub fn listen_from_onset(&mut self) {
        let kept = std::mem::take(&mut self.buffer);
        let speech = self.speech;
        self.clear();
        self.mode = MonitorMode::Listening;
        if !kept.is_empty() {
            self.buffer = kept;
            self.speech = speech;
            self.elapsed = speech;
            self.phase = Phase::Speaking;
        }
    }

    /// Watch for learner speech while the tutor talks.
    pub fn watch_for_onset(&mut self) {
        self.clear();
        self.mode = MonitorMode::WatchingForOnset;
    }

    /// Drop buffers until told otherwise.
    pub fn sleep(&mut self) {
        self.clear();
        self.mode = MonitorMode::Dormant;
    }

    /// Forget classifier calibration (new capture stream).
    pub fn reset(&mut self) {
        self.classifier.reset();
        self.sleep();
    }

    fn clear(&mut self) {
        self.phase = Phase::Waiting;
        self.elapsed = Duration::ZERO;
        self.speech = Duration::ZERO;
        self.silence = Duration::ZERO;
        self.ticks = 0;
        self.buffer.clear();
    }

    /// Feed one buffer. Returns at most one event.
    pub fn observe(&mut self, chunk: &AudioChunk, now: DateTime<Utc>) -> Option<MonitorEvent> {
        match self.mode {
            MonitorMode::Dormant => None,
            MonitorMode::WatchingForOnset => self.observe_onset(chunk),
            MonitorMode::Listening => self.observe_listening(chunk, now),
        }
    }

    fn observe_onset(&mut self, chunk: &AudioChunk) -> Option<MonitorEvent> {
        if self.classifier.is_speech(chunk) {
            self.sample_rate = chunk.sample_rate;
            self.speech += chunk.duration();
            self.buffer.extend_from_slice(&chunk.samples);
            if self.speech >= ONSET_MIN_SPEECH {
                info!("⚡ Speech onset while tutor is speaking");
                self.mode = MonitorMode::Dormant;
                return Some(MonitorEvent::SpeechOnsetDetected);
            }
        } else {
            self.speech = Duration::ZERO;
            self.buffer.clear();
        }
        None
    }

    fn observe_listening(&mut self, chunk: &AudioChunk, now: DateTime<Utc>) -> Option<MonitorEvent> {
        let d = chunk.duration();
        self.elapsed += d;
        self.sample_rate = chunk.sample_rate;
        let is_speech = self.classifier.is_speech(chunk);

        match (self.phase, is_speech) {
            // Waiting -> Speaking: learner started talking
            (Phase::Waiting, true) => {
                info!("🎤 Speech started");
                self.phase = Phase::Speaking;
                self.speech = d;
                self.silence = Duration::ZERO;
                self.buffer.clear();
                self.buffer.extend_from_slice(&chunk.samples);
                if self.speech >= self.config.pause_threshold {
                    return Some(self.finalize(now));
                }
                Some(MonitorEvent::SpeechStarted)
            }

            (Phase::Waiting, false) => {
                if self.elapsed >= self.config.listening_timeout {
                    info!("⏱️ No speech within {:?}", self.config.listening_timeout);
                    self.sleep();
                    return Some(MonitorEvent::ListeningTimedOut);
                }
                None
            }

            // Speaking -> Speaking, or TrailingSilence -> Speaking (false alarm)
            (Phase::Speaking, true) | (Phase::TrailingSilence, true) => {
                if self.phase == Phase::TrailingSilence {
                    debug!("🎤 Speech resumed");
                }
                self.phase = Phase::Speaking;
                self.silence = Duration::ZERO;
                self.speech += d;
                self.buffer.extend_from_slice(&chunk.samples);

                if self.speech >= self.config.pause_threshold {
                    info!("⏱️ Pause threshold reached, finalizing utterance");
                    return Some(self.finalize(now));
                }
                let secs = self.speech.as_secs();
                if secs > self.ticks {
                    self.ticks = secs;
                    debug!("🎤 Speech continuing: {:?}", self.speech);
                    return Some(MonitorEvent::SpeechOngoing {
                        speech: self.speech,
                    });
                }
                None
            }

            // Speaking -> TrailingSilence, or counting silence toward the gap
            (Phase::Speaking, false) | (Phase::TrailingSilence, false) => {
                if self.phase == Phase::Speaking {
                    debug!("🤫 Silence detected");
                }
                self.phase = Phase::TrailingSilence;
                self.silence += d;
                self.buffer.extend_from_slice(&chunk.samples);

                if self.silence < self.config.silence_threshold {
                    return None;
                }
                if self.speech < MIN_UTTERANCE {
                    debug!("⏭️ Speech too short ({:?}), ignoring", self.speech);
                    self.phase = Phase::Waiting;
                    self.speech = Duration::ZERO;
                    self.silence = Duration::ZERO;
                    self.ticks = 0;
                    self.buffer.clear();
                    if self.elapsed >= self.config.listening_timeout {
                        self.sleep();
                        return Some(MonitorEvent::ListeningTimedOut);
                    }
                    return None;
                }
                info!("✅ Silence threshold reached, finalizing utterance");
                Some(self.finalize(now))
            }
        }
    }

    fn finalize(&mut self, now: DateTime<Utc>) -> MonitorEvent {
        let span = AudioSpan {
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.sample_rate,
            speech_duration: self.speech,
            finalized_at: now,
        };
        info!(
            "🎯 Utterance finalized: {:?} speech, {} samples",
            span.speech_duration,
            span.samples.len()
        );
        self.sleep();
        MonitorEvent::UtteranceFinalized(span)
    }
}
