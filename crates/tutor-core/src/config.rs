//! Voice loop settings snapshot.
//!
//! The learner edits these in the app's settings screen; the loop reads one
//! immutable [`VoiceLoopConfig`] when a session starts and never writes it back.
//!
//! | Field | Default | Description |
//! |-------|---------|-------------|
//! | auto_start_recording | true | Start listening as soon as the session opens. |
//! | speaking_rate | 1.0 | Tutor speech rate multiplier. |
//! | pitch_multiplier | 1.0 | Tutor voice pitch multiplier. |
//! | response_delay | 500 ms | Cooldown after the tutor finishes before listening again. |
//! | listening_timeout | 10 s | Give up listening when no speech starts within this window. |
//! | silence_threshold | 1.5 s | Trailing silence that ends an utterance. |
//! | pause_threshold | 30 s | Longest utterance before it is cut and sent anyway. |
//! | interruption_allowed | true | Learner speech may cut the tutor off (barge-in). |
//! | echo_mode_enabled | false | Keep the microphone open while the tutor speaks. |
//! | voice_detection_sensitivity | 0.5 | 0.0 (deaf) .. 1.0 (hears everything). |
//! | background_noise_reduction | true | Track the noise floor and ignore steady background. |
//! | recognition_timeout | 10 s | Longest wait for a transcript. |
//! | generation_timeout | 20 s | Longest wait for a tutor reply. |
//!
//! Durations are stored as integer milliseconds.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment prefix for layered overrides, e.g. `TUTOR_VOICE__SILENCE_THRESHOLD=1200`.
pub const ENV_PREFIX: &str = "TUTOR_VOICE";

/// Immutable per-session settings for the voice loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceLoopConfig {
    pub auto_start_recording: bool,
    pub speaking_rate: f32,
    pub pitch_multiplier: f32,
    #[serde(with = "duration_ms")]
    pub response_delay: Duration,
    #[serde(with = "duration_ms")]
    pub listening_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub silence_threshold: Duration,
    #[serde(with = "duration_ms")]
    pub pause_threshold: Duration,
    pub interruption_allowed: bool,
    pub echo_mode_enabled: bool,
    pub voice_detection_sensitivity: f32,
    pub background_noise_reduction: bool,
    #[serde(with = "duration_ms")]
    pub recognition_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub generation_timeout: Duration,
}

impl Default for VoiceLoopConfig {
    fn default() -> Self {
        Self {
            auto_start_recording: true,
            speaking_rate: 1.0,
            pitch_multiplier: 1.0,
            response_delay: Duration::from_millis(500),
            listening_timeout: Duration::from_secs(10),
            silence_threshold: Duration::from_millis(1500),
            pause_threshold: Duration::from_secs(30),
            interruption_allowed: true,
            echo_mode_enabled: false,
            voice_detection_sensitivity: 0.5,
            background_noise_reduction: true,
            recognition_timeout: Duration::from_secs(10),
            generation_timeout: Duration::from_secs(20),
        }
    }
}

impl VoiceLoopConfig {
    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        let positive = [
            ("listening_timeout", self.listening_timeout),
            ("silence_threshold", self.silence_threshold),
            ("pause_threshold", self.pause_threshold),
            ("recognition_timeout", self.recognition_timeout),
            ("generation_timeout", self.generation_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(CoreError::InvalidConfig(format!("{} must be greater than zero", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.voice_detection_sensitivity) {
            return Err(CoreError::InvalidConfig(format!(
                "voice_detection_sensitivity must be within 0.0..=1.0, got {}",
                self.voice_detection_sensitivity
            )));
        }
        if !(self.speaking_rate > 0.0 && self.speaking_rate <= 4.0) {
            return Err(CoreError::InvalidConfig(format!(
                "speaking_rate must be within (0, 4], got {}",
                self.speaking_rate
            )));
        }
        if !(0.5..=2.0).contains(&self.pitch_multiplier) {
            return Err(CoreError::InvalidConfig(format!(
                "pitch_multiplier must be within 0.5..=2.0, got {}",
                self.pitch_multiplier
            )));
        }
        Ok(())
    }

    /// Barge-in detection runs while the tutor is speaking only when both
    /// interruption and echo mode are on.
    pub fn barge_in_enabled(&self) -> bool {
        self.interruption_allowed && self.echo_mode_enabled
    }

    /// Load from an optional TOML file, then `TUTOR_VOICE__*` environment overrides.
    /// Missing file or fields fall back to defaults.
    pub fn load_layered(path: Option<&Path>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let loaded: VoiceLoopConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn to_toml(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = VoiceLoopConfig::default();
        assert!(c.validate().is_ok());
        assert!(c.auto_start_recording);
        assert_eq!(c.silence_threshold, Duration::from_millis(1500));
        assert!(!c.barge_in_enabled());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let c = VoiceLoopConfig {
            voice_detection_sensitivity: 1.5,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        let c = VoiceLoopConfig {
            silence_threshold: Duration::ZERO,
            ..Default::default()
        };
        assert!(c.validate().is_err());

        let c = VoiceLoopConfig {
            pitch_multiplier: 3.0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn durations_serialize_as_millis() {
        let c = VoiceLoopConfig::default();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["response_delay"], 500);
        assert_eq!(json["listening_timeout"], 10_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        std::fs::write(&path, "silence_threshold = 900\necho_mode_enabled = true\n").unwrap();

        let c = VoiceLoopConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(c.silence_threshold, Duration::from_millis(900));
        assert!(c.echo_mode_enabled);
        assert_eq!(c.listening_timeout, Duration::from_secs(10));
    }

    #[test]
    fn toml_output_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        let c = VoiceLoopConfig {
            speaking_rate: 0.8,
            interruption_allowed: false,
            ..Default::default()
        };
        std::fs::write(&path, c.to_toml().unwrap()).unwrap();
        let loaded = VoiceLoopConfig::load_layered(Some(&path)).unwrap();
        assert_eq!(loaded, c);
    }
}
