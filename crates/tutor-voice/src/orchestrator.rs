//! Voice loop entry point.
//!
//! [`VoiceLoop`] is built once with the four capabilities and a preference
//! store. Each [`VoiceLoop::start_session`] reads a fresh settings snapshot,
//! spawns a scheduler task for that session, and returns a [`SessionHandle`].
//! Dropping the handle stops the session.

use crate::audio::AudioSource;
use crate::error::{VoiceError, VoiceResult};
use crate::generator::ResponseGenerator;
use crate::scheduler::{Command, LoopEvent, LoopSnapshot, LoopState, SchedulerParts, TurnScheduler};
use crate::stt::Recognizer;
use crate::voice_output::SpeechEngine;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use tutor_core::store::load_validated;
use tutor_core::{Clock, ConfigStore, LessonRef, ProgressStore, SessionOutcome, SystemClock};

/// Buffered events per subscriber before the slowest one starts missing events.
const EVENT_CAPACITY: usize = 256;

const COMMAND_CAPACITY: usize = 32;

/// The external engines the loop drives.
#[derive(Clone)]
pub struct Capabilities {
    pub audio: Arc<dyn AudioSource>,
    pub recognizer: Arc<dyn Recognizer>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub speech: Arc<dyn SpeechEngine>,
}

/// Builds sessions. Holds no session state itself.
pub struct VoiceLoop {
    capabilities: Capabilities,
    config_store: Arc<dyn ConfigStore>,
    progress_store: Option<Arc<dyn ProgressStore>>,
    clock: Arc<dyn Clock>,
}

impl VoiceLoop {
    pub fn new(capabilities: Capabilities, config_store: Arc<dyn ConfigStore>) -> Self {
        Self {
            capabilities,
            config_store,
            progress_store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Record practiced minutes and streaks here when a session completes.
    pub fn with_progress_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.progress_store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start a conversation for `lesson`. Fails if the stored settings are
    /// invalid or the microphone cannot be opened for auto-start.
    pub async fn start_session(&self, lesson: LessonRef) -> VoiceResult<SessionHandle> {
        let config = load_validated(self.config_store.as_ref())?;
        info!(
            "⚙️ Voice settings: silence {:?}, timeout {:?}, barge-in {}",
            config.silence_threshold,
            config.listening_timeout,
            config.barge_in_enabled()
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        // The scheduler holds the only sender, so streams end when it exits.
        let (events, events_rx) = broadcast::channel(EVENT_CAPACITY);
        let (mut scheduler, snapshots) = TurnScheduler::new(SchedulerParts {
            config,
            lesson,
            capabilities: self.capabilities.clone(),
            clock: Arc::clone(&self.clock),
            progress: self.progress_store.clone(),
            commands: command_rx,
            events,
        });
        scheduler.boot().await?;
        let task = tokio::spawn(scheduler.run());

        Ok(SessionHandle {
            commands: command_tx,
            events: events_rx,
            snapshots,
            task,
        })
    }
}

/// Caller side of one running session.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    /// Never read; only resubscribed.
    events: broadcast::Receiver<LoopEvent>,
    snapshots: watch::Receiver<LoopSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<VoiceResult<T>>) -> Command,
    ) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| VoiceError::ChannelClosed("voice loop is not running".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::ChannelClosed("voice loop dropped the request".to_string()))?
    }

    /// Turn listening on or off. Off cancels anything in flight and leaves the
    /// session usable for typed messages.
    pub async fn toggle_voice_mode(&self, on: bool) -> VoiceResult<()> {
        self.request(|reply| Command::ToggleVoice { on, reply }).await
    }

    /// Send a typed learner message. Returns once the user turn is committed;
    /// the tutor's reply arrives as events.
    pub async fn send_text_message(&self, text: impl Into<String>) -> VoiceResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    /// End the conversation without scoring it yet.
    pub async fn stop_session(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Stop the loop, finalize the session and return the score. Only once.
    pub async fn complete_session(&self) -> VoiceResult<SessionOutcome> {
        self.request(|reply| Command::Complete { reply }).await
    }

    /// Raw event receiver. Sees events sent after this call; closes when the
    /// scheduler exits.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.resubscribe()
    }

    /// Event stream. Ends after `SessionCompleted`, or when the scheduler exits
    /// because the handle was dropped. Events missed by a lagging consumer are
    /// skipped.
    pub fn events(&self) -> BoxStream<'static, LoopEvent> {
        BroadcastStream::new(self.events.resubscribe())
            .filter_map(|item| async move {
                match item {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!("Event stream lagged: {}", e);
                        None
                    }
                }
            })
            .scan(false, |finished, event| {
                let next = if *finished {
                    None
                } else {
                    *finished = matches!(event, LoopEvent::SessionCompleted { .. });
                    Some(event)
                };
                async move { next }
            })
            .boxed()
    }

    pub fn snapshots(&self) -> watch::Receiver<LoopSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> LoopSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> LoopState {
        self.snapshots.borrow().state
    }

    /// True once the scheduler task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
