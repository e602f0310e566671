//! Tutor speech output and the barge-in kill-switch.
//!
//! [`SpeechOutputPlayer`] runs one [`SpeechEngine::play`] call at a time on a
//! spawned task and reports what happened as [`PlaybackEvent`]s tagged with the
//! scheduler epoch that requested it. `Completed` is only sent when the engine's
//! future resolves, so the loop never guesses at playback length.
//! [`SpeechOutputPlayer::cancel`] stops playback and waits for the task to exit
//! before reporting `Canceled`.

use crate::error::VoiceResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to say and how.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    /// Rate multiplier (1.0 = normal)
    pub rate: f32,
    /// Pitch multiplier (1.0 = normal)
    pub pitch: f32,
}

/// Synthesis plus playback. `play` resolves when the audio has finished playing
/// and must return promptly once `cancel` fires, with no further audio.
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    async fn play(&self, request: &SpeechRequest, cancel: CancellationToken) -> VoiceResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackKind {
    Started,
    Completed,
    /// Synthesis or playback failed; no (more) audio will play.
    Failed(String),
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub epoch: u64,
    pub kind: PlaybackKind,
}

struct ActivePlayback {
    epoch: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the single active playback.
pub struct SpeechOutputPlayer {
    engine: Arc<dyn SpeechEngine>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    active: Option<ActivePlayback>,
}

impl SpeechOutputPlayer {
    pub fn new(engine: Arc<dyn SpeechEngine>, events: mpsc::UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            engine,
            events,
            active: None,
        }
    }

    /// True while a playback task is running.
    pub fn is_playing(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    /// Start speaking under `epoch`. Any active playback is canceled first.
    /// `parent` is the scheduler's turn token; canceling it stops this playback too.
    pub async fn speak(&mut self, epoch: u64, request: SpeechRequest, parent: &CancellationToken) {
        self.cancel().await;

        let token = parent.child_token();
        let engine = Arc::clone(&self.engine);
        let events = self.events.clone();
        let task_token = token.clone();

        info!("🔊 Speaking ({} chars, rate {:.2})", request.text.len(), request.rate);
        let handle = tokio::spawn(async move {
            let _ = events.send(PlaybackEvent {
                epoch,
                kind: PlaybackKind::Started,
            });
            let result = engine.play(&request, task_token.clone()).await;
            if task_token.is_cancelled() {
                // cancel() reports this one
                return;
            }
            let kind = match result {
                Ok(()) => PlaybackKind::Completed,
                Err(e) => {
                    warn!("Speech output failed: {}", e);
                    PlaybackKind::Failed(e.to_string())
                }
            };
            let _ = events.send(PlaybackEvent { epoch, kind });
        });

        self.active = Some(ActivePlayback {
            epoch,
            token,
            handle,
        });
    }

    /// Stop playback now. Returns once the playback task has exited; a
    /// `Canceled` event is sent if audio was still playing.
    pub async fn cancel(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        let was_playing = !active.handle.is_finished();
        active.token.cancel();
        if let Err(e) = active.handle.await {
            warn!("Playback task ended abnormally: {}", e);
        }
        if was_playing {
            info!("🛑 Playback canceled");
            let _ = self.events.send(PlaybackEvent {
                epoch: active.epoch,
                kind: PlaybackKind::Canceled,
            });
        } else {
            debug!("Playback already finished, nothing to cancel");
        }
        was_playing
    }
}

#[cfg(feature = "device")]
pub use device::HttpSpeechEngine;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::error::VoiceError;
    use rodio::{OutputStream, Sink};
    use std::io::Cursor;
    use std::time::Duration;

    const POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// OpenAI-compatible TTS (`/audio/speech`) played through the default output device.
    /// Uses `TTS_API_URL`, `TTS_API_KEY` (or OPENROUTER_API_KEY), `TTS_MODEL`, `TTS_VOICE`.
    pub struct HttpSpeechEngine {
        base_url: String,
        api_key: String,
        model: String,
        voice: String,
        client: reqwest::Client,
    }

    impl HttpSpeechEngine {
        pub fn from_env() -> VoiceResult<Self> {
            let base_url = std::env::var("TTS_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
            let api_key = std::env::var("TTS_API_KEY")
                .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
                .map_err(|_| {
                    VoiceError::Config("TTS requires TTS_API_KEY or OPENROUTER_API_KEY".to_string())
                })?;
            let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
            let voice = std::env::var("TTS_VOICE").unwrap_or_else(|_| "shimmer".to_string());
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            Ok(Self {
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
                model,
                voice,
                client,
            })
        }

        async fn synthesize(&self, text: &str, speed: f32) -> VoiceResult<Vec<u8>> {
            let body = serde_json::json!({
                "model": self.model,
                "input": text,
                "voice": self.voice,
                "speed": speed.clamp(0.25, 4.0),
            });
            let res = self
                .client
                .post(format!("{}/audio/speech", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
            }
            let bytes = res
                .bytes()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            Ok(bytes.to_vec())
        }
    }

    #[async_trait]
    impl SpeechEngine for HttpSpeechEngine {
        async fn play(&self, request: &SpeechRequest, cancel: CancellationToken) -> VoiceResult<()> {
            let text = request.text.trim();
            if text.is_empty() {
                return Ok(());
            }
            // The sink resamples by `pitch`, which also speeds audio up; the API
            // speed compensates so the net tempo stays at `rate`.
            let pitch = request.pitch.max(0.1);
            let bytes = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = self.synthesize(text, request.rate / pitch) => res?,
            };
            if bytes.is_empty() {
                return Ok(());
            }

            // OutputStream is !Send: open, play and poll on a blocking thread.
            tokio::task::spawn_blocking(move || -> VoiceResult<()> {
                let (_stream, handle) =
                    OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
                let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
                let source = rodio::Decoder::new(Cursor::new(bytes))
                    .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
                sink.set_speed(pitch);
                sink.append(source);
                while !sink.empty() {
                    if cancel.is_cancelled() {
                        sink.stop();
                        break;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Ok(())
            })
            .await
            .map_err(|e| VoiceError::Playback(e.to_string()))?
        }
    }
}
