//! Audio capture port and buffer types.
//!
//! The loop only sees [`AudioSource`]: `start()` hands back a channel of
//! [`AudioChunk`]s and `stop()` releases the microphone. With the `device`
//! feature, [`CpalAudioSource`] captures from the default input device.

use crate::error::VoiceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

/// Audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Buffer size in samples (default: 480 for 30ms at 16kHz)
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            buffer_size: 480, // 30ms at 16kHz
        }
    }
}

/// One buffer of mono PCM from the microphone.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    pub sample_rate: u32,

    /// Voice-activity hint from a source that runs its own VAD.
    pub voiced: Option<bool>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            voiced: None,
        }
    }

    /// Playback length of this buffer.
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Exact playback length of `samples` at `sample_rate`.
pub fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / u64::from(sample_rate))
}

/// Average interleaved frames of `channels` samples down to mono.
/// A trailing partial frame is averaged over the samples it has.
pub fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(usize::from(channels))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// A finalized utterance handed to recognition.
#[derive(Debug, Clone)]
pub struct AudioSpan {
    /// PCM samples (f32, -1.0..1.0) from speech onset to the end of trailing silence.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Speech time inside the span, excluding trailing silence.
    pub speech_duration: Duration,
    /// When the span was finalized.
    pub finalized_at: DateTime<Utc>,
}

impl AudioSpan {
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }
}

/// Microphone capability.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Start capturing. Buffers arrive on the returned channel until `stop` is
    /// called; the channel closing while the loop is listening is treated as a
    /// lost microphone.
    async fn start(&self) -> VoiceResult<mpsc::Receiver<AudioChunk>>;

    /// Stop capturing and release the device. Idempotent.
    async fn stop(&self);
}

#[cfg(feature = "device")]
pub use device::CpalAudioSource;

#[cfg(feature = "device")]
mod device {
    use super::*;
    use crate::error::VoiceError;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use crate::vad::WebRtcVad;
    use std::sync::mpsc::{RecvTimeoutError, TryRecvError};
    use std::sync::Mutex;
    use std::thread;
    use tracing::{error, info, warn};

    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Microphone capture via CPAL, tagged by WebRTC VAD. Stream and VAD live on
    /// a dedicated thread until `stop` is called.
    pub struct CpalAudioSource {
        config: AudioConfig,
        sensitivity: f32,
        stop_tx: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl CpalAudioSource {
        pub fn new(config: AudioConfig, sensitivity: f32) -> Self {
            Self {
                config,
                sensitivity,
                stop_tx: Mutex::new(None),
            }
        }

        /// List available input devices
        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }

    #[async_trait]
    impl AudioSource for CpalAudioSource {
        async fn start(&self) -> VoiceResult<mpsc::Receiver<AudioChunk>> {
            self.stop().await;

            let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>(256);
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<VoiceResult<()>>();
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
            let config = self.config.clone();
            let sensitivity = self.sensitivity;

            // VAD + capture in a dedicated thread (cpal Stream and webrtc Vad are !Send)
            thread::spawn(move || {
                let (raw_tx, raw_rx) = std::sync::mpsc::channel::<Vec<f32>>();
                let stream = match build_stream(&config, raw_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut vad = match WebRtcVad::new(config.sample_rate, sensitivity) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!("WebRTC VAD unavailable, falling back to energy gate: {}", e);
                        None
                    }
                };
                let _ = ready_tx.send(Ok(()));

                loop {
                    match stop_rx.try_recv() {
                        Ok(()) | Err(TryRecvError::Disconnected) => break,
                        Err(TryRecvError::Empty) => {}
                    }
                    let samples = match raw_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(samples) => samples,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let mut chunk = AudioChunk::new(samples, config.sample_rate);
                    if let Some(vad) = vad.as_mut().filter(|v| v.frame_size() == chunk.samples.len()) {
                        chunk.voiced = vad.is_speech(&chunk.samples).ok();
                    }
                    if let Err(e) = chunk_tx.try_send(chunk) {
                        warn!("Failed to send audio chunk: {}", e);
                        if chunk_tx.is_closed() {
                            break;
                        }
                    }
                }
                drop(stream);
                info!("⏹️ Audio capture stopped");
            });

            ready_rx
                .await
                .map_err(|_| VoiceError::AudioDevice("capture thread exited".to_string()))??;
            *self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop_tx);
            Ok(chunk_rx)
        }

        async fn stop(&self) {
            if let Some(tx) = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(());
            }
        }
    }

    fn build_stream(
        config: &AudioConfig,
        raw_tx: std::sync::mpsc::Sender<Vec<f32>>,
    ) -> VoiceResult<cpal::Stream> {
        info!(
            "🎤 Initializing audio capture ({}Hz, {} channels)",
            config.sample_rate, config.channels
        );
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
        info!(
            "📱 Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        device.default_input_config()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
        };

        // buffer_size counts mono samples after the downmix
        let buffer_size = config.buffer_size;
        let channels = config.channels;
        let mut sample_buffer = Vec::with_capacity(buffer_size);

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for sample in downmix(data, channels) {
                    sample_buffer.push(sample);
                    if sample_buffer.len() >= buffer_size {
                        let _ = raw_tx.send(std::mem::replace(
                            &mut sample_buffer,
                            Vec::with_capacity(buffer_size),
                        ));
                    }
                }
            },
            move |err| {
                error!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }
}
