//! Conversation data model: turns, feedback and the practice session that owns them.
//!
//! A [`PracticeSession`] is the single owner of its turn log and feedback list.
//! Turns can only be added through [`PracticeSession::append_turn`], which keeps
//! the log ordered (user first, never two tutor turns in a row, non-decreasing
//! timestamps). Feedback is written by the [`FeedbackAccumulator`](crate::FeedbackAccumulator).

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Tutor,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("user"),
            Speaker::Tutor => f.write_str("tutor"),
        }
    }
}

/// One entry in the conversation log. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub speaker: Speaker,
    pub text: String,
    pub translation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Category of a correction note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Pronunciation,
    Grammar,
    Vocabulary,
    Fluency,
    Comprehension,
}

impl FeedbackKind {
    pub const ALL: [FeedbackKind; 5] = [
        FeedbackKind::Pronunciation,
        FeedbackKind::Grammar,
        FeedbackKind::Vocabulary,
        FeedbackKind::Fluency,
        FeedbackKind::Comprehension,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackKind::Pronunciation => "pronunciation",
            FeedbackKind::Grammar => "grammar",
            FeedbackKind::Vocabulary => "vocabulary",
            FeedbackKind::Fluency => "fluency",
            FeedbackKind::Comprehension => "comprehension",
        }
    }
}

impl fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        FeedbackKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown feedback kind: {}", s)))
    }
}

/// A correction note recorded for the session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFeedback {
    pub timestamp: DateTime<Utc>,
    pub kind: FeedbackKind,
    pub content: String,
    pub suggestion: Option<String>,
}

/// A correction as returned by the response generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    /// What the learner got wrong.
    pub error: String,
    /// The corrected form.
    pub correction: String,
    /// Category supplied by the generator; `None` means grammar.
    #[serde(default)]
    pub kind: Option<FeedbackKind>,
}

impl Correction {
    pub fn new(error: impl Into<String>, correction: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            correction: correction.into(),
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: FeedbackKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// The lesson a conversation is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonRef {
    pub id: String,
    pub title: String,
    /// Target language, e.g. "Spanish".
    pub language: String,
    /// Learner level label, e.g. "A2" or "Beginner".
    pub level_label: String,
}

impl LessonRef {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        language: impl Into<String>,
        level_label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            language: language.into(),
            level_label: level_label.into(),
        }
    }
}

/// One conversation practice session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeSession {
    id: Uuid,
    lesson: LessonRef,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    score: Option<u32>,
    feedback: Vec<SessionFeedback>,
    turns: Vec<ConversationTurn>,
}

impl PracticeSession {
    pub fn new(lesson: LessonRef, start_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lesson,
            start_time,
            end_time: None,
            score: None,
            feedback: Vec::new(),
            turns: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lesson(&self) -> &LessonRef {
        &self.lesson
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    pub fn score(&self) -> Option<u32> {
        self.score
    }

    pub fn feedback(&self) -> &[SessionFeedback] {
        &self.feedback
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last_speaker(&self) -> Option<Speaker> {
        self.turns.last().map(|t| t.speaker)
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    /// Append a turn to the log.
    ///
    /// Fails if the session is finalized, if the first turn is not a user turn,
    /// or if a tutor turn would follow another tutor turn. A timestamp earlier
    /// than the previous turn is clamped up to it.
    pub fn append_turn(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
        translation: Option<String>,
        at: DateTime<Utc>,
    ) -> CoreResult<&ConversationTurn> {
        if self.is_finalized() {
            return Err(CoreError::SessionFinalized);
        }
        if speaker == Speaker::Tutor && self.last_speaker() != Some(Speaker::User) {
            return Err(CoreError::TurnOrder(
                "a tutor turn must answer a user turn".to_string(),
            ));
        }

        let timestamp = match self.turns.last() {
            Some(prev) if prev.timestamp > at => prev.timestamp,
            _ => at,
        };
        self.turns.push(ConversationTurn {
            id: Uuid::new_v4(),
            speaker,
            text: text.into(),
            translation,
            timestamp,
        });
        Ok(&self.turns[self.turns.len() - 1])
    }

    pub(crate) fn push_feedback(&mut self, entry: SessionFeedback) -> CoreResult<()> {
        if self.is_finalized() {
            return Err(CoreError::SessionFinalized);
        }
        self.feedback.push(entry);
        Ok(())
    }

    /// Set end time and score. Succeeds exactly once.
    pub(crate) fn finalize(&mut self, end_time: DateTime<Utc>, score: u32) -> CoreResult<()> {
        if self.is_finalized() {
            return Err(CoreError::SessionFinalized);
        }
        self.end_time = Some(end_time.max(self.start_time));
        self.score = Some(score);
        Ok(())
    }
}
