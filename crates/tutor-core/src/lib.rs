//! tutor-core: the conversation practice data model.
//!
//! Shared by the voice loop and anything that renders or persists a session:
//! turns and feedback, the per-session [`VoiceLoopConfig`] snapshot, the
//! preference store ports, scoring, and daily-goal / streak progress.

pub mod clock;
pub mod config;
mod error;
pub mod feedback;
pub mod model;
pub mod progress;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::VoiceLoopConfig;
pub use error::{CoreError, CoreResult};
pub use feedback::{
    minutes_practiced, score, FeedbackAccumulator, SessionMetrics, SessionOutcome,
};
pub use model::{
    ConversationTurn, Correction, FeedbackKind, LessonRef, PracticeSession, SessionFeedback,
    Speaker,
};
pub use progress::LearnerProgress;
pub use store::{ConfigStore, FileConfigStore, MemoryStore, ProgressStore, SledStore};
