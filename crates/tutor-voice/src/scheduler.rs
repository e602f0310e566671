//! Turn scheduler: the single writer of session state.
//!
//! One tokio task owns the [`PracticeSession`], the [`FeedbackAccumulator`],
//! the monitor and the player. Everything else talks to it by message: caller
//! commands arrive with a oneshot for the answer, and every piece of async work
//! (recognition, generation, playback, the cooldown timer) reports back tagged
//! with the epoch it was started under. Each message is handled to completion
//! before the next one is read, and a result whose epoch is no longer current
//! is dropped.
//!
//! ```text
//!   Idle ──► Listening ──► Transcribing ──► AwaitingReply ──► Speaking ──► Cooldown
//!    ▲          ▲  │              │                │              │            │
//!    │          │  └─ timeout ────┴── failure ─────┘   barge-in ──┘            │
//!    │          └──────────────────────────────────────────────────────────────┘
//!    └── voice off                                      any ──► Ended (stop / fatal)
//! ```

use crate::audio::{AudioChunk, AudioSpan};
use crate::error::{GenerationError, RecognitionError, VoiceError, VoiceResult};
use crate::generator::{GeneratedReply, GenerationRequest};
use crate::monitor::{MonitorConfig, MonitorEvent, VoiceActivityMonitor};
use crate::orchestrator::Capabilities;
use crate::voice_output::{PlaybackEvent, PlaybackKind, SpeechOutputPlayer, SpeechRequest};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tutor_core::{
    Clock, ConversationTurn, FeedbackAccumulator, LessonRef, PracticeSession, ProgressStore,
    SessionFeedback, SessionMetrics, SessionOutcome, Speaker, VoiceLoopConfig,
};

/// Turns of history handed to the generator.
pub const CONTEXT_TURNS: usize = 12;

/// Attempts per utterance (or per reply) before a transient failure is surfaced.
const MAX_ATTEMPTS: u8 = 2;

/// Loop state as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Listening,
    Transcribing,
    AwaitingReply,
    Speaking,
    Cooldown,
    Ended,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Listening => "listening",
            LoopState::Transcribing => "transcribing",
            LoopState::AwaitingReply => "awaiting_reply",
            LoopState::Speaking => "speaking",
            LoopState::Cooldown => "cooldown",
            LoopState::Ended => "ended",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable loop events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StateChanged { from: LoopState, to: LoopState },
    TurnAppended { turn: ConversationTurn },
    FeedbackAdded { feedback: SessionFeedback },
    /// Learner speech is being heard (start, then about once a second).
    Hearing { speech: Duration },
    /// Learner speech cut the tutor off.
    BargeIn,
    ListeningTimedOut,
    /// Recoverable problem worth showing to the learner.
    Notice { message: String },
    /// The session ended because a capability is gone for good.
    Fatal { message: String },
    SessionCompleted { score: u32, metrics: SessionMetrics },
}

/// Read-only view published after every change.
#[derive(Debug, Clone)]
pub struct LoopSnapshot {
    pub state: LoopState,
    pub voice_mode: bool,
    pub epoch: u64,
    pub session: PracticeSession,
    pub fatal: Option<String>,
}

pub(crate) enum Command {
    ToggleVoice {
        on: bool,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Complete {
        reply: oneshot::Sender<VoiceResult<SessionOutcome>>,
    },
}

/// Results of spawned work.
enum Work {
    Transcribed {
        epoch: u64,
        result: Result<String, RecognitionError>,
    },
    Generated {
        epoch: u64,
        result: Result<GeneratedReply, GenerationError>,
    },
}

/// Everything the scheduler needs from its owner.
pub(crate) struct SchedulerParts {
    pub config: VoiceLoopConfig,
    pub lesson: LessonRef,
    pub capabilities: Capabilities,
    pub clock: Arc<dyn Clock>,
    pub progress: Option<Arc<dyn ProgressStore>>,
    pub commands: mpsc::Receiver<Command>,
    pub events: broadcast::Sender<LoopEvent>,
}

pub(crate) struct TurnScheduler {
    config: VoiceLoopConfig,
    caps: Capabilities,
    clock: Arc<dyn Clock>,
    progress: Option<Arc<dyn ProgressStore>>,

    state: LoopState,
    voice_mode: bool,
    epoch: u64,
    session_token: CancellationToken,
    turn_token: CancellationToken,

    session: PracticeSession,
    accumulator: FeedbackAccumulator,
    monitor: VoiceActivityMonitor,
    player: SpeechOutputPlayer,

    // Channels
    commands: mpsc::Receiver<Command>,
    audio_rx: Option<mpsc::Receiver<AudioChunk>>,
    work_tx: mpsc::UnboundedSender<Work>,
    work_rx: mpsc::UnboundedReceiver<Work>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    events: broadcast::Sender<LoopEvent>,
    snapshots: watch::Sender<LoopSnapshot>,

    cooldown_until: Option<Instant>,
    /// Wall-clock backstop for the listening timeout, in case capture stalls.
    listen_deadline: Option<Instant>,
    pending_span: Option<AudioSpan>,
    pending_request: Option<GenerationRequest>,
    attempts: u8,
    fatal: Option<String>,
    completed: bool,
    dirty: bool,
}

/// Wake-up reasons for the run loop.
enum Wake {
    Command(Option<Command>),
    Audio(Option<AudioChunk>),
    Work(Work),
    Playback(PlaybackEvent),
    CooldownElapsed,
    ListenDeadline,
}

async fn next_chunk(rx: &mut Option<mpsc::Receiver<AudioChunk>>) -> Option<AudioChunk> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(until: Option<Instant>) {
    match until {
        Some(t) => tokio::time::sleep_until(t).await,
        None => std::future::pending().await,
    }
}

impl TurnScheduler {
    pub(crate) fn new(parts: SchedulerParts) -> (Self, watch::Receiver<LoopSnapshot>) {
        let SchedulerParts {
            config,
            lesson,
            capabilities,
            clock,
            progress,
            commands,
            events,
        } = parts;

        let session = PracticeSession::new(lesson, clock.now());
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let player = SpeechOutputPlayer::new(Arc::clone(&capabilities.speech), playback_tx);
        let monitor = VoiceActivityMonitor::new(MonitorConfig::from(&config));
        let session_token = CancellationToken::new();
        let turn_token = session_token.child_token();

        let (snapshots, snapshot_rx) = watch::channel(LoopSnapshot {
            state: LoopState::Idle,
            voice_mode: false,
            epoch: 0,
            session: session.clone(),
            fatal: None,
        });

        info!(
            "🎓 Session {} started: {} ({}, {})",
            session.id(),
            session.lesson().title,
            session.lesson().language,
            session.lesson().level_label
        );

        let scheduler = Self {
            config,
            caps: capabilities,
            clock,
            progress,
            state: LoopState::Idle,
            voice_mode: false,
            epoch: 0,
            session_token,
            turn_token,
            session,
            accumulator: FeedbackAccumulator::new(),
            monitor,
            player,
            commands,
            audio_rx: None,
            work_tx,
            work_rx,
            playback_rx,
            events,
            snapshots,
            cooldown_until: None,
            listen_deadline: None,
            pending_span: None,
            pending_request: None,
            attempts: 0,
            fatal: None,
            completed: false,
            dirty: false,
        };
        (scheduler, snapshot_rx)
    }

    /// Open the microphone and start listening when auto-start is on.
    pub(crate) async fn boot(&mut self) -> VoiceResult<()> {
        if self.config.auto_start_recording {
            self.voice_mode = true;
            self.ensure_capture().await?;
            self.listen(false).await;
        }
        self.dirty = true;
        self.publish();
        Ok(())
    }

    pub(crate) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                Some(work) = self.work_rx.recv() => Wake::Work(work),
                Some(ev) = self.playback_rx.recv() => Wake::Playback(ev),
                chunk = next_chunk(&mut self.audio_rx) => Wake::Audio(chunk),
                _ = deadline(self.cooldown_until) => Wake::CooldownElapsed,
                _ = deadline(self.listen_deadline) => Wake::ListenDeadline,
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(cmd)) => self.on_command(cmd).await,
                Wake::Audio(Some(chunk)) => self.on_audio(chunk).await,
                Wake::Audio(None) => self.on_audio_closed().await,
                Wake::Work(work) => self.on_work(work).await,
                Wake::Playback(ev) => self.on_playback(ev),
                Wake::CooldownElapsed => self.on_cooldown_elapsed().await,
                Wake::ListenDeadline => self.on_listen_deadline().await,
            }
            self.publish();
        }

        // Handle dropped
        self.player.cancel().await;
        self.release_capture().await;
        self.session_token.cancel();
        debug!("Scheduler for session {} exited", self.session.id());
    }

    // ---------------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------------

    async fn on_command(&mut self, cmd: Command) {
        // Publish before answering so the caller never reads a stale snapshot.
        match cmd {
            Command::ToggleVoice { on, reply } => {
                let result = self.toggle_voice(on).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::SendText { text, reply } => {
                let result = self.send_text(text).await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.shutdown(LoopState::Ended).await;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::Complete { reply } => {
                let result = self.complete().await;
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    fn ensure_live(&self) -> VoiceResult<()> {
        if self.state == LoopState::Ended {
            let why = self.fatal.clone().unwrap_or_else(|| "stopped".to_string());
            return Err(VoiceError::SessionEnded(why));
        }
        Ok(())
    }

    async fn toggle_voice(&mut self, on: bool) -> VoiceResult<()> {
        self.ensure_live()?;
        if !on {
            info!("🔇 Voice mode off");
            self.voice_mode = false;
            self.shutdown(LoopState::Idle).await;
            return Ok(());
        }

        info!("🎙️ Voice mode on");
        self.voice_mode = true;
        self.dirty = true;
        if self.state == LoopState::Idle {
            if let Err(e) = self.ensure_capture().await {
                if e.is_fatal() {
                    self.fail(&e).await;
                }
                return Err(e);
            }
            self.listen(false).await;
        }
        Ok(())
    }

    async fn send_text(&mut self, text: String) -> VoiceResult<()> {
        self.ensure_live()?;
        match self.state {
            LoopState::Transcribing => return Err(VoiceError::Busy("transcribing")),
            LoopState::AwaitingReply => return Err(VoiceError::Busy("waiting for the tutor")),
            LoopState::Speaking => {
                self.player.cancel().await;
            }
            _ => {}
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            debug!("Ignoring empty text message");
            return Ok(());
        }
        self.commit_user_turn(text)
    }

    /// Cancel everything in flight and settle in `to` (Idle or Ended).
    async fn shutdown(&mut self, to: LoopState) {
        if self.state == LoopState::AwaitingReply {
            self.accumulator.reply_abandoned();
        }
        self.player.cancel().await;
        self.release_capture().await;
        self.pending_span = None;
        self.pending_request = None;
        if self.state != to {
            self.enter(to);
        } else {
            // Same state: still invalidate anything tagged with the old epoch.
            self.bump_epoch();
        }
    }

    async fn complete(&mut self) -> VoiceResult<SessionOutcome> {
        if self.completed {
            return Err(VoiceError::AlreadyCompleted);
        }
        self.shutdown(LoopState::Ended).await;

        let outcome = self.accumulator.complete(&mut self.session, self.clock.now())?;
        self.completed = true;
        self.dirty = true;

        if let Some(store) = &self.progress {
            let today = self.clock.today();
            let saved = store.load_progress().and_then(|mut progress| {
                progress.record_practice(outcome.metrics.minutes_practiced, today);
                store.save_progress(&progress)?;
                Ok(progress)
            });
            match saved {
                Ok(progress) => info!(
                    "📈 Today: {}/{} min, streak {} day(s)",
                    progress.today_minutes, progress.daily_goal_minutes, progress.streak_days
                ),
                Err(e) => warn!("Failed to update learner progress: {}", e),
            }
        }

        self.emit(LoopEvent::SessionCompleted {
            score: outcome.score,
            metrics: outcome.metrics.clone(),
        });
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Audio
    // ---------------------------------------------------------------------

    async fn on_audio(&mut self, chunk: AudioChunk) {
        let Some(event) = self.monitor.observe(&chunk, self.clock.now()) else {
            return;
        };
        match (self.state, event) {
            (LoopState::Listening, MonitorEvent::SpeechStarted) => {
                // Audio is flowing; the monitor owns the timeout from here.
                self.listen_deadline = None;
                self.emit(LoopEvent::Hearing {
                    speech: Duration::ZERO,
                });
            }
            (LoopState::Listening, MonitorEvent::SpeechOngoing { speech }) => {
                self.emit(LoopEvent::Hearing { speech });
            }
            (LoopState::Listening, MonitorEvent::UtteranceFinalized(span)) => {
                self.enter(LoopState::Transcribing);
                self.pending_span = Some(span);
                self.attempts = 0;
                self.spawn_recognition();
            }
            (LoopState::Listening, MonitorEvent::ListeningTimedOut) => {
                self.listening_timed_out().await;
            }
            (LoopState::Speaking, MonitorEvent::SpeechOnsetDetected) => {
                self.barge_in().await;
            }
            (LoopState::Cooldown, MonitorEvent::SpeechOnsetDetected) => {
                debug!("Learner spoke during cooldown, listening now");
                self.listen(true).await;
            }
            (state, event) => {
                debug!("Ignoring {:?} in {}", event, state);
            }
        }
    }

    async fn on_listen_deadline(&mut self) {
        self.listen_deadline = None;
        if self.state != LoopState::Listening {
            return;
        }
        warn!(
            "No speech heard within {:?} of wall time, capture may be stalled",
            self.config.listening_timeout
        );
        self.listening_timed_out().await;
    }

    async fn listening_timed_out(&mut self) {
        info!("⏱️ Listening timed out, going idle");
        self.emit(LoopEvent::ListeningTimedOut);
        self.release_capture().await;
        self.enter(LoopState::Idle);
    }

    async fn on_audio_closed(&mut self) {
        self.audio_rx = None;
        if self.voice_mode && self.state != LoopState::Ended {
            self.fail(&VoiceError::AudioDevice("microphone stream closed".to_string()))
                .await;
        }
    }

    async fn barge_in(&mut self) {
        info!("⚡ Barge-in: stopping tutor speech");
        self.player.cancel().await;
        self.accumulator.record_interruption();
        self.emit(LoopEvent::BargeIn);
        self.listen(false).await;
    }

    async fn ensure_capture(&mut self) -> VoiceResult<()> {
        if self.audio_rx.is_none() {
            let rx = self.caps.audio.start().await?;
            self.monitor.reset();
            self.audio_rx = Some(rx);
            debug!("🎤 Capture started");
        }
        Ok(())
    }

    async fn release_capture(&mut self) {
        if self.audio_rx.take().is_some() {
            self.caps.audio.stop().await;
            debug!("🎤 Capture released");
        }
    }

    // ---------------------------------------------------------------------
    // Recognition and generation
    // ---------------------------------------------------------------------

    fn spawn_recognition(&mut self) {
        let Some(span) = self.pending_span.clone() else {
            return;
        };
        self.attempts += 1;
        let recognizer = Arc::clone(&self.caps.recognizer);
        let tx = self.work_tx.clone();
        let token = self.turn_token.clone();
        let epoch = self.epoch;
        let limit = self.config.recognition_timeout;
        debug!(
            "📝 Transcribing {:?} of speech (attempt {})",
            span.speech_duration, self.attempts
        );

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = tokio::time::timeout(limit, recognizer.transcribe(&span)) => {
                    r.unwrap_or(Err(RecognitionError::Timeout))
                }
            };
            let _ = tx.send(Work::Transcribed { epoch, result });
        });
    }

    fn spawn_generation(&mut self) {
        let Some(request) = self.pending_request.clone() else {
            return;
        };
        self.attempts += 1;
        let generator = Arc::clone(&self.caps.generator);
        let tx = self.work_tx.clone();
        let token = self.turn_token.clone();
        let epoch = self.epoch;
        let limit = self.config.generation_timeout;
        debug!("💭 Asking tutor (attempt {})", self.attempts);

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = tokio::time::timeout(limit, generator.generate(&request)) => {
                    r.unwrap_or(Err(GenerationError::Timeout))
                }
            };
            let _ = tx.send(Work::Generated { epoch, result });
        });
    }

    async fn on_work(&mut self, work: Work) {
        match work {
            Work::Transcribed { epoch, result } => {
                if epoch != self.epoch || self.state != LoopState::Transcribing {
                    debug!("Dropping stale transcript (epoch {})", epoch);
                    return;
                }
                self.on_transcribed(result).await;
            }
            Work::Generated { epoch, result } => {
                if epoch != self.epoch || self.state != LoopState::AwaitingReply {
                    debug!("Dropping stale reply (epoch {})", epoch);
                    return;
                }
                self.on_generated(result).await;
            }
        }
    }

    async fn on_transcribed(&mut self, result: Result<String, RecognitionError>) {
        match result {
            Ok(text) if text.trim().is_empty() => {
                debug!("Nothing intelligible was said");
                self.pending_span = None;
                self.resume_after_turn().await;
            }
            Ok(text) => {
                self.pending_span = None;
                info!("👤 Learner: {}", text.trim());
                if let Err(e) = self.commit_user_turn(text.trim().to_string()) {
                    error!("Failed to commit user turn: {}", e);
                    self.resume_after_turn().await;
                }
            }
            Err(e) => {
                let err = VoiceError::from(e);
                if err.is_fatal() {
                    self.fail(&err).await;
                } else if self.attempts < MAX_ATTEMPTS {
                    warn!("Recognition failed ({}), retrying", err);
                    self.spawn_recognition();
                } else {
                    warn!("Recognition failed again ({}), giving up on this utterance", err);
                    self.pending_span = None;
                    self.accumulator.record_recoverable_error();
                    self.emit(LoopEvent::Notice {
                        message: "Sorry, I couldn't catch that. Please try again.".to_string(),
                    });
                    self.resume_after_turn().await;
                }
            }
        }
    }

    /// Append the learner's turn, then ask the tutor.
    fn commit_user_turn(&mut self, text: String) -> VoiceResult<()> {
        let now = self.clock.now();
        let turn = self
            .session
            .append_turn(Speaker::User, text.clone(), None, now)?
            .clone();
        self.accumulator.user_turn_committed(turn.timestamp);
        self.emit(LoopEvent::TurnAppended { turn });

        let turns = self.session.turns();
        let context = turns[turns.len().saturating_sub(CONTEXT_TURNS)..].to_vec();
        self.pending_request = Some(GenerationRequest {
            language: self.session.lesson().language.clone(),
            level_label: self.session.lesson().level_label.clone(),
            context,
            user_text: text,
        });

        self.enter(LoopState::AwaitingReply);
        self.attempts = 0;
        self.spawn_generation();
        Ok(())
    }

    async fn on_generated(&mut self, result: Result<GeneratedReply, GenerationError>) {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let err = VoiceError::from(e);
                if err.is_fatal() {
                    self.fail(&err).await;
                } else if self.attempts < MAX_ATTEMPTS {
                    warn!("Tutor reply failed ({}), retrying", err);
                    self.spawn_generation();
                } else {
                    warn!("Tutor reply failed again ({}), back to the learner", err);
                    self.pending_request = None;
                    self.accumulator.reply_abandoned();
                    self.accumulator.record_recoverable_error();
                    self.emit(LoopEvent::Notice {
                        message: "The tutor couldn't answer just now. Please say that again."
                            .to_string(),
                    });
                    self.resume_after_turn().await;
                }
                return;
            }
        };
        self.pending_request = None;

        let now = self.clock.now();
        let turn = match self.session.append_turn(
            Speaker::Tutor,
            reply.reply_text.clone(),
            reply.reply_translation.clone(),
            now,
        ) {
            Ok(turn) => turn.clone(),
            Err(e) => {
                error!("Failed to commit tutor turn: {}", e);
                self.resume_after_turn().await;
                return;
            }
        };
        info!("🧑‍🏫 Tutor: {}", turn.text);
        self.emit(LoopEvent::TurnAppended { turn });

        match self
            .accumulator
            .record_reply(&mut self.session, &reply.corrections, now)
        {
            Ok(added) => {
                for feedback in added {
                    self.emit(LoopEvent::FeedbackAdded { feedback });
                }
            }
            Err(e) => error!("Failed to record corrections: {}", e),
        }

        if !self.voice_mode {
            self.enter(LoopState::Idle);
            return;
        }
        self.enter(LoopState::Speaking);
        if self.config.barge_in_enabled() {
            self.monitor.watch_for_onset();
        }
        let request = SpeechRequest {
            text: reply.reply_text,
            rate: self.config.speaking_rate,
            pitch: self.config.pitch_multiplier,
        };
        self.player.speak(self.epoch, request, &self.turn_token).await;
    }

    // ---------------------------------------------------------------------
    // Playback and cooldown
    // ---------------------------------------------------------------------

    fn on_playback(&mut self, ev: PlaybackEvent) {
        if ev.epoch != self.epoch || self.state != LoopState::Speaking {
            debug!("Dropping stale playback event {:?}", ev);
            return;
        }
        match ev.kind {
            PlaybackKind::Started => debug!("🔊 Playback started"),
            PlaybackKind::Completed => {
                debug!("🔊 Playback complete");
                self.start_cooldown();
            }
            PlaybackKind::Failed(reason) => {
                warn!("Tutor speech failed: {}", reason);
                self.accumulator.record_recoverable_error();
                self.emit(LoopEvent::Notice {
                    message: "Tutor audio is unavailable; the reply is shown as text.".to_string(),
                });
                self.start_cooldown();
            }
            PlaybackKind::Canceled => {}
        }
    }

    fn start_cooldown(&mut self) {
        self.enter(LoopState::Cooldown);
        self.cooldown_until = Some(Instant::now() + self.config.response_delay);
        if self.config.interruption_allowed && self.audio_rx.is_some() {
            self.monitor.watch_for_onset();
        }
    }

    async fn on_cooldown_elapsed(&mut self) {
        self.cooldown_until = None;
        if self.state != LoopState::Cooldown {
            return;
        }
        self.resume_after_turn().await;
    }

    /// Back to the learner: listen in voice mode, otherwise wait for typed input.
    async fn resume_after_turn(&mut self) {
        if self.voice_mode {
            self.listen(false).await;
        } else {
            self.enter(LoopState::Idle);
        }
    }

    /// Enter Listening, reopening the microphone if it was released.
    async fn listen(&mut self, keep_onset: bool) {
        if let Err(e) = self.ensure_capture().await {
            if e.is_fatal() {
                self.fail(&e).await;
            } else {
                warn!("Could not resume listening: {}", e);
                self.emit(LoopEvent::Notice {
                    message: "The microphone is not available right now.".to_string(),
                });
                self.enter(LoopState::Idle);
            }
            return;
        }
        self.enter(LoopState::Listening);
        if keep_onset {
            self.monitor.listen_from_onset();
        } else {
            self.monitor.listen();
            self.listen_deadline = Some(Instant::now() + self.config.listening_timeout);
        }
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    fn bump_epoch(&mut self) {
        self.turn_token.cancel();
        self.turn_token = self.session_token.child_token();
        self.epoch += 1;
        self.cooldown_until = None;
        self.listen_deadline = None;
        self.dirty = true;
    }

    /// Leave the current state: cancel its work and timers, then announce `to`.
    fn enter(&mut self, to: LoopState) {
        let from = self.state;
        self.bump_epoch();
        if to != LoopState::Listening {
            // Listening configures the monitor itself (it may keep onset audio).
            self.monitor.sleep();
        }
        self.state = to;
        info!("🔄 {} → {}", from, to);
        self.emit(LoopEvent::StateChanged { from, to });
    }

    async fn fail(&mut self, err: &VoiceError) {
        error!("💥 Fatal voice loop error: {}", err);
        let message = err.to_string();
        self.fatal = Some(message.clone());
        self.voice_mode = false;
        self.shutdown(LoopState::Ended).await;
        self.emit(LoopEvent::Fatal { message });
    }

    fn emit(&mut self, event: LoopEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
        self.dirty = true;
    }

    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.snapshots.send_replace(LoopSnapshot {
            state: self.state,
            voice_mode: self.voice_mode,
            epoch: self.epoch,
            session: self.session.clone(),
            fatal: self.fatal.clone(),
        });
    }
}
