//! Scripted capabilities for driving the voice loop without hardware or network.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tutor_voice::tutor_core::{LessonRef, ManualClock, VoiceLoopConfig};
use tutor_voice::{
    AudioChunk, AudioSource, AudioSpan, Capabilities, GeneratedReply, GenerationError,
    GenerationRequest, LoopEvent, LoopState, RecognitionError, Recognizer, ResponseGenerator,
    SessionHandle, SpeechEngine, SpeechRequest, VoiceError, VoiceResult,
};

pub const RATE: u32 = 16000;
pub const CHUNK: usize = 480; // 30ms
pub const WAIT: Duration = Duration::from_secs(5);

/// Amplitude of learner speech in scripted audio.
pub const VOICE: f32 = 0.5;
/// Amplitude of tutor echo picked up by the microphone.
pub const ECHO: f32 = 0.3;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Short thresholds so a whole conversation runs in milliseconds.
pub fn fast_config() -> VoiceLoopConfig {
    VoiceLoopConfig {
        response_delay: Duration::from_millis(40),
        listening_timeout: Duration::from_millis(600),
        silence_threshold: Duration::from_millis(90),
        pause_threshold: Duration::from_secs(5),
        recognition_timeout: Duration::from_millis(500),
        generation_timeout: Duration::from_millis(500),
        ..VoiceLoopConfig::default()
    }
}

pub fn lesson() -> LessonRef {
    LessonRef::new("de-cafe", "Im Café", "German", "A2")
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 18, 0, 0).unwrap(),
    ))
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

type Slot = Arc<Mutex<Option<mpsc::Sender<AudioChunk>>>>;

/// Microphone whose buffers are pushed by the test through a [`MicFeeder`].
#[derive(Default)]
pub struct ScriptedMic {
    slot: Slot,
    starts: AtomicUsize,
}

impl ScriptedMic {
    pub fn new() -> (Arc<Self>, MicFeeder) {
        let mic = Arc::new(Self::default());
        let feeder = MicFeeder {
            slot: Arc::clone(&mic.slot),
        };
        (mic, feeder)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSource for ScriptedMic {
    async fn start(&self) -> VoiceResult<mpsc::Receiver<AudioChunk>> {
        let (tx, rx) = mpsc::channel(1024);
        *self.slot.lock().unwrap() = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&self) {
        self.slot.lock().unwrap().take();
    }
}

/// Microphone that is never allowed.
pub struct DeniedMic;

#[async_trait]
impl AudioSource for DeniedMic {
    async fn start(&self) -> VoiceResult<mpsc::Receiver<AudioChunk>> {
        Err(VoiceError::PermissionDenied)
    }

    async fn stop(&self) {}
}

#[derive(Clone)]
pub struct MicFeeder {
    slot: Slot,
}

impl MicFeeder {
    pub fn is_open(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Push `ms` of audio at `level`. Stops early if the loop releases the microphone.
    async fn push(&self, level: f32, ms: u64) {
        let tx = self.slot.lock().unwrap().clone().expect("microphone is not open");
        for _ in 0..(ms / 30) {
            if tx
                .send(AudioChunk::new(vec![level; CHUNK], RATE))
                .await
                .is_err()
            {
                break;
            }
        }
    }

    pub async fn speech(&self, ms: u64) {
        self.push(VOICE, ms).await;
    }

    pub async fn echo(&self, ms: u64) {
        self.push(ECHO, ms).await;
    }

    pub async fn silence(&self, ms: u64) {
        self.push(0.0, ms).await;
    }

    /// 300ms of speech followed by enough silence to end the utterance.
    pub async fn utterance(&self) {
        self.speech(300).await;
        self.silence(120).await;
    }

    /// Simulate the device disappearing.
    pub fn unplug(&self) {
        self.slot.lock().unwrap().take();
    }
}

// ---------------------------------------------------------------------------
// Recognizer
// ---------------------------------------------------------------------------

/// Returns scripted results in order, then `"Hallo"`. Records every span.
#[derive(Default)]
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Result<String, RecognitionError>>>,
    spans: Mutex<Vec<AudioSpan>>,
}

impl ScriptedRecognizer {
    pub fn with(results: Vec<Result<String, RecognitionError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            spans: Mutex::new(Vec::new()),
        })
    }

    pub fn spans(&self) -> Vec<AudioSpan> {
        self.spans.lock().unwrap().clone()
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn transcribe(&self, span: &AudioSpan) -> Result<String, RecognitionError> {
        self.spans.lock().unwrap().push(span.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Hallo".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Returns scripted replies in order, then `"Gut!"`, after an optional delay.
#[derive(Default)]
pub struct ScriptedTutor {
    script: Mutex<VecDeque<Result<GeneratedReply, GenerationError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Duration,
}

impl ScriptedTutor {
    pub fn with(replies: Vec<Result<GeneratedReply, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedTutor {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(GeneratedReply::new("Gut!").with_translation("Good!")))
    }
}

// ---------------------------------------------------------------------------
// Speech output
// ---------------------------------------------------------------------------

/// "Plays" for a fixed time unless canceled, or fails every time.
pub struct FakeSpeaker {
    length: Duration,
    broken: bool,
    played: Mutex<Vec<SpeechRequest>>,
    canceled: AtomicUsize,
}

impl FakeSpeaker {
    pub fn lasting(length: Duration) -> Arc<Self> {
        Arc::new(Self {
            length,
            broken: false,
            played: Mutex::new(Vec::new()),
            canceled: AtomicUsize::new(0),
        })
    }

    pub fn broken() -> Arc<Self> {
        Arc::new(Self {
            length: Duration::ZERO,
            broken: true,
            played: Mutex::new(Vec::new()),
            canceled: AtomicUsize::new(0),
        })
    }

    pub fn played(&self) -> Vec<SpeechRequest> {
        self.played.lock().unwrap().clone()
    }

    pub fn canceled(&self) -> usize {
        self.canceled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechEngine for FakeSpeaker {
    async fn play(&self, request: &SpeechRequest, cancel: CancellationToken) -> VoiceResult<()> {
        self.played.lock().unwrap().push(request.clone());
        if self.broken {
            return Err(VoiceError::Synthesis("no voice for this language".into()));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                self.canceled.fetch_add(1, Ordering::SeqCst);
            }
            _ = tokio::time::sleep(self.length) => {}
        }
        Ok(())
    }
}

pub fn capabilities(
    mic: Arc<dyn AudioSource>,
    recognizer: Arc<dyn Recognizer>,
    tutor: Arc<dyn ResponseGenerator>,
    speaker: Arc<dyn SpeechEngine>,
) -> Capabilities {
    Capabilities {
        audio: mic,
        recognizer,
        generator: tutor,
        speech: speaker,
    }
}

// ---------------------------------------------------------------------------
// Waiting
// ---------------------------------------------------------------------------

/// Next event matching `pred`, skipping others.
pub async fn next_event(
    rx: &mut broadcast::Receiver<LoopEvent>,
    pred: impl Fn(&LoopEvent) -> bool,
) -> LoopEvent {
    timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn entered(rx: &mut broadcast::Receiver<LoopEvent>, state: LoopState) {
    next_event(rx, |ev| matches!(ev, LoopEvent::StateChanged { to, .. } if *to == state)).await;
}

/// Wait until the published snapshot reaches `state`.
pub async fn wait_for_state(handle: &SessionHandle, state: LoopState) {
    let mut rx = handle.snapshots();
    timeout(WAIT, async {
        loop {
            if rx.borrow_and_update().state == state {
                return;
            }
            rx.changed().await.expect("voice loop exited");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", state));
}

/// Collect events for `window` without blocking the test forever.
pub async fn drain(rx: &mut broadcast::Receiver<LoopEvent>, window: Duration) -> Vec<LoopEvent> {
    let mut seen = Vec::new();
    let _ = timeout(window, async {
        while let Ok(ev) = rx.recv().await {
            seen.push(ev);
        }
    })
    .await;
    seen
}
