//! Speech/silence classification for single audio buffers.
//!
//! [`EnergyClassifier`] is the default: an RMS gate whose threshold follows
//! `voice_detection_sensitivity`, optionally raised above a tracked noise floor.
//! With the `device` feature, [`WebRtcVad`] wraps the WebRTC VAD; it is not
//! `Send`, so the capture thread runs it and tags each chunk with a hint.

use crate::audio::AudioChunk;
use tracing::debug;

/// RMS threshold at sensitivity 0.0 (only loud speech counts).
const MAX_THRESHOLD: f32 = 0.2;
/// RMS threshold at sensitivity 1.0 (almost anything counts).
const MIN_THRESHOLD: f32 = 0.002;
/// With noise reduction on, speech must be this many times louder than the floor.
const NOISE_MARGIN: f32 = 3.0;
/// Upward adaptation rate of the noise floor per silent buffer.
const FLOOR_RISE: f32 = 0.05;
/// Upward creep per speech buffer. Speech dips between words pull the floor
/// back down; a steady hum does not, so it stops counting after about a second.
const FLOOR_CREEP: f32 = 0.01;

/// Decides whether one buffer contains speech.
pub trait SpeechClassifier: Send {
    fn is_speech(&mut self, chunk: &AudioChunk) -> bool;

    /// Forget adaptive state (called at the start of each listening episode).
    fn reset(&mut self) {}
}

/// Root-mean-square level of `samples`.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Energy gate driven by sensitivity and an optional noise floor.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold: f32,
    noise_reduction: bool,
    noise_floor: f32,
}

impl EnergyClassifier {
    /// `sensitivity` in 0.0..=1.0; higher hears quieter speech.
    pub fn new(sensitivity: f32, noise_reduction: bool) -> Self {
        let s = sensitivity.clamp(0.0, 1.0);
        // Log interpolation: 0.5 lands on 0.02.
        let threshold = MAX_THRESHOLD * (MIN_THRESHOLD / MAX_THRESHOLD).powf(s);
        Self {
            threshold,
            noise_reduction,
            noise_floor: 0.0,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn is_speech(&mut self, chunk: &AudioChunk) -> bool {
        if let Some(hint) = chunk.voiced {
            return hint;
        }
        let level = rms(&chunk.samples);
        let mut speech = level > self.threshold;
        if self.noise_reduction {
            speech = speech && level > self.noise_floor * NOISE_MARGIN;
            if level < self.noise_floor {
                self.noise_floor = level;
            } else {
                let rate = if speech { FLOOR_CREEP } else { FLOOR_RISE };
                self.noise_floor += (level - self.noise_floor) * rate;
            }
        }
        debug!(
            level,
            floor = self.noise_floor,
            "VAD result: {}",
            if speech { "SPEECH" } else { "SILENCE" }
        );
        speech
    }

    fn reset(&mut self) {
        self.noise_floor = 0.0;
    }
}

#[cfg(feature = "device")]
pub use webrtc::WebRtcVad;

#[cfg(feature = "device")]
mod webrtc {
    use crate::error::{VoiceError, VoiceResult};
    use tracing::info;
    use webrtc_vad::{SampleRate, Vad, VadMode};

    /// WebRTC VAD for 30 ms frames. Not `Send`; keep it on the capture thread.
    pub struct WebRtcVad {
        vad: Vad,
        frame_size: usize,
    }

    impl WebRtcVad {
        /// Higher sensitivity selects a less aggressive mode (more audio counts as speech).
        pub fn new(sample_rate: u32, sensitivity: f32) -> VoiceResult<Self> {
            let rate = match sample_rate {
                8000 => SampleRate::Rate8kHz,
                16000 => SampleRate::Rate16kHz,
                32000 => SampleRate::Rate32kHz,
                48000 => SampleRate::Rate48kHz,
                other => {
                    return Err(VoiceError::Config(format!(
                        "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                        other
                    )))
                }
            };
            let mode = match ((1.0 - sensitivity.clamp(0.0, 1.0)) * 3.0).round() as u8 {
                0 => VadMode::Quality,
                1 => VadMode::LowBitrate,
                2 => VadMode::Aggressive,
                _ => VadMode::VeryAggressive,
            };
            let mut vad = Vad::new();
            vad.set_mode(mode);
            vad.set_sample_rate(rate);
            // WebRTC VAD requires 10, 20 or 30 ms frames
            let frame_size = (sample_rate as usize * 30) / 1000;
            info!("✅ WebRTC VAD initialized (frame: {} samples)", frame_size);
            Ok(Self { vad, frame_size })
        }

        pub fn frame_size(&self) -> usize {
            self.frame_size
        }

        /// Classify one frame of exactly `frame_size` samples.
        pub fn is_speech(&mut self, samples: &[f32]) -> VoiceResult<bool> {
            if samples.len() != self.frame_size {
                return Err(VoiceError::VadProcessing(format!(
                    "Expected {} samples, got {}",
                    self.frame_size,
                    samples.len()
                )));
            }
            let pcm: Vec<i16> = samples
                .iter()
                .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                .collect();
            self.vad
                .is_voice_segment(&pcm)
                .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(level: f32) -> AudioChunk {
        AudioChunk::new(vec![level; 480], 16000)
    }

    #[test]
    fn sensitivity_moves_threshold() {
        let deaf = EnergyClassifier::new(0.0, false);
        let mid = EnergyClassifier::new(0.5, false);
        let keen = EnergyClassifier::new(1.0, false);
        assert!((deaf.threshold() - 0.2).abs() < 1e-6);
        assert!((mid.threshold() - 0.02).abs() < 1e-4);
        assert!((keen.threshold() - 0.002).abs() < 1e-6);
    }

    #[test]
    fn silence_and_speech() {
        let mut c = EnergyClassifier::new(0.5, false);
        assert!(!c.is_speech(&chunk(0.0)));
        assert!(c.is_speech(&chunk(0.4)));
        assert!(!c.is_speech(&chunk(0.01)));
    }

    #[test]
    fn noise_floor_raises_the_bar() {
        let mut c = EnergyClassifier::new(0.9, true);
        // Steady hum just under the bar, repeated until the floor settles.
        for _ in 0..200 {
            assert!(!c.is_speech(&chunk(0.003)));
        }
        assert!(c.noise_floor() > 0.0025);
        // Quiet talk that would pass the raw threshold but not the margin.
        assert!(!c.is_speech(&chunk(0.008)));
        assert!(c.is_speech(&chunk(0.3)));
        c.reset();
        assert_eq!(c.noise_floor(), 0.0);
    }

    #[test]
    fn steady_hum_stops_counting_as_speech() {
        let mut c = EnergyClassifier::new(0.5, true);
        // Room hum well above the raw 0.02 threshold, for 30 seconds.
        let flagged = (0..1000).filter(|_| c.is_speech(&chunk(0.05))).count();
        assert!(flagged < 60, "hum counted as speech {} times", flagged);
        assert!(c.noise_floor() > 0.05 / NOISE_MARGIN);
        for _ in 0..100 {
            assert!(!c.is_speech(&chunk(0.05)));
        }
        // Talking over the hum is still heard.
        assert!(c.is_speech(&chunk(0.3)));
    }

    #[test]
    fn speech_with_pauses_keeps_the_floor_low() {
        let mut c = EnergyClassifier::new(0.5, true);
        let mut heard = 0;
        for i in 0..300 {
            // Syllables with a quiet gap every fifth buffer.
            let level = if i % 5 == 4 { 0.001 } else { 0.3 };
            if c.is_speech(&chunk(level)) {
                heard += 1;
            }
        }
        assert_eq!(heard, 240);
    }

    #[test]
    fn source_hint_wins() {
        let mut c = EnergyClassifier::new(0.5, true);
        let mut loud = chunk(0.9);
        loud.voiced = Some(false);
        assert!(!c.is_speech(&loud));
    }
}
