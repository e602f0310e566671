//! # tutor-voice: adaptive voice conversation loop
//!
//! Listens to the learner, detects the end of each utterance, transcribes it,
//! asks the tutor for a reply, speaks the reply and listens again. The learner
//! can cut the tutor off mid-sentence (barge-in) and can type instead of talk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     TurnScheduler (one task)                     │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌──────────────────┐   │
//! │  │ AudioSource │ → │ VoiceActivity    │ → │ Recognizer       │   │
//! │  │  (cpal)     │   │ Monitor (gap)    │   │ (STT over HTTP)  │   │
//! │  └─────────────┘   └──────────────────┘   └──────────────────┘   │
//! │         ↑ onset                                    ↓ transcript  │
//! │  ┌─────────────┐        cancel            ┌──────────────────┐   │
//! │  │ SpeechOutput│ ←─────────────────────── │ ResponseGenerator│   │
//! │  │ Player      │        reply             │ (chat JSON)      │   │
//! │  └─────────────┘                          └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Start with [`VoiceLoop::start_session`]; drive and observe the session
//! through the returned [`SessionHandle`].

pub mod audio;
pub mod error;
pub mod generator;
pub mod logging;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
pub mod stt;
pub mod vad;
pub mod voice_output;

pub use audio::{AudioChunk, AudioConfig, AudioSource, AudioSpan};
#[cfg(feature = "device")]
pub use audio::CpalAudioSource;
pub use error::{GenerationError, RecognitionError, VoiceError, VoiceResult};
pub use generator::{ChatTutor, GeneratedReply, GenerationRequest, ResponseGenerator};
pub use logging::init_tracing;
pub use monitor::{MonitorConfig, MonitorEvent, MonitorMode, VoiceActivityMonitor};
pub use orchestrator::{Capabilities, SessionHandle, VoiceLoop};
pub use scheduler::{LoopEvent, LoopSnapshot, LoopState};
pub use stt::{HttpRecognizer, Recognizer};
pub use vad::{EnergyClassifier, SpeechClassifier};
#[cfg(feature = "device")]
pub use vad::WebRtcVad;
pub use voice_output::{PlaybackEvent, PlaybackKind, SpeechEngine, SpeechOutputPlayer, SpeechRequest};
#[cfg(feature = "device")]
pub use voice_output::HttpSpeechEngine;

// Re-exported so callers need only one dependency for the common types.
pub use tutor_core;
