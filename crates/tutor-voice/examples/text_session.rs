//! Typed practice session: no microphone, no speaker.
//!
//! Type a line to send it to the tutor, an empty line to finish and see the
//! score. Uses `ChatTutor` when `TUTOR_LLM_API_KEY` (or `OPENROUTER_API_KEY`)
//! is set, otherwise a tutor that just echoes you back. Events are printed as
//! JSON lines.
//!
//! ```text
//! cargo run -p tutor-voice --example text_session
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tutor_voice::tutor_core::{LessonRef, MemoryStore, VoiceLoopConfig};
use tutor_voice::{
    init_tracing, AudioChunk, AudioSource, AudioSpan, Capabilities, ChatTutor, GeneratedReply,
    GenerationError, GenerationRequest, RecognitionError, Recognizer, ResponseGenerator,
    SpeechEngine, SpeechRequest, VoiceError, VoiceLoop, VoiceResult,
};

struct NoMicrophone;

#[async_trait]
impl AudioSource for NoMicrophone {
    async fn start(&self) -> VoiceResult<tokio::sync::mpsc::Receiver<AudioChunk>> {
        Err(VoiceError::AudioDevice("this example has no microphone".to_string()))
    }

    async fn stop(&self) {}
}

struct NoRecognizer;

#[async_trait]
impl Recognizer for NoRecognizer {
    async fn transcribe(&self, _span: &AudioSpan) -> Result<String, RecognitionError> {
        Ok(String::new())
    }
}

struct Silent;

#[async_trait]
impl SpeechEngine for Silent {
    async fn play(&self, _request: &SpeechRequest, _cancel: CancellationToken) -> VoiceResult<()> {
        Ok(())
    }
}

struct EchoTutor;

#[async_trait]
impl ResponseGenerator for EchoTutor {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedReply, GenerationError> {
        Ok(GeneratedReply::new(format!("Du hast gesagt: {}", request.user_text))
            .with_translation(format!("You said: {}", request.user_text)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let generator: Arc<dyn ResponseGenerator> = match ChatTutor::from_env() {
        Ok(tutor) => {
            info!("Using ChatTutor for replies");
            Arc::new(tutor)
        }
        Err(e) => {
            info!("No tutor model configured ({}), echoing instead", e);
            Arc::new(EchoTutor)
        }
    };

    let capabilities = Capabilities {
        audio: Arc::new(NoMicrophone),
        recognizer: Arc::new(NoRecognizer),
        generator,
        speech: Arc::new(Silent),
    };
    let store = Arc::new(MemoryStore::new(VoiceLoopConfig {
        auto_start_recording: false,
        ..VoiceLoopConfig::default()
    }));

    let voice_loop = VoiceLoop::new(capabilities, store.clone()).with_progress_store(store);
    let handle = voice_loop
        .start_session(LessonRef::new("de-intro", "Sich vorstellen", "German", "A1"))
        .await?;

    let mut events = handle.events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => eprintln!("unprintable event: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            break;
        }
        if let Err(e) = handle.send_text_message(line).await {
            eprintln!("{}", e);
        }
    }

    let outcome = handle.complete_session().await?;
    info!(
        "Session finished: {} point(s), {} turn(s), {} correction(s)",
        outcome.score,
        outcome.session.turns().len(),
        outcome.metrics.corrections
    );
    drop(handle);
    printer.await?;
    Ok(())
}
