//! Feedback accumulation and end-of-session scoring.
//!
//! Every correction the tutor returns becomes exactly one [`SessionFeedback`]
//! entry. Timing data (reply latency, barge-ins, recovered errors) is kept
//! alongside so [`SessionMetrics`] can be recomputed on demand; metrics are
//! never stored as a source of truth.

use crate::error::CoreResult;
use crate::model::{Correction, FeedbackKind, PracticeSession, SessionFeedback, Speaker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Points per whole minute practiced.
pub const POINTS_PER_MINUTE: u32 = 10;

/// Bonus for finishing a session without a single correction.
pub const CLEAN_SESSION_BONUS: u32 = 50;

/// Whole minutes between `start` and `end`, rounded down. Negative spans count as zero.
pub fn minutes_practiced(start: DateTime<Utc>, end: DateTime<Utc>) -> u32 {
    let secs = (end - start).num_seconds().max(0);
    u32::try_from(secs / 60).unwrap_or(u32::MAX)
}

/// `minutes * 10 + (no feedback ? 50 : 0)`
pub fn score(minutes_practiced: u32, feedback_is_empty: bool) -> u32 {
    let bonus = if feedback_is_empty { CLEAN_SESSION_BONUS } else { 0 };
    minutes_practiced.saturating_mul(POINTS_PER_MINUTE).saturating_add(bonus)
}

/// Aggregated view of a session, derived from the session and accumulator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub elapsed: Duration,
    pub minutes_practiced: u32,
    pub user_turns: usize,
    pub tutor_turns: usize,
    pub corrections: usize,
    pub feedback_by_kind: BTreeMap<FeedbackKind, usize>,
    pub interruptions: u32,
    pub recoverable_errors: u32,
    pub average_reply_latency: Option<Duration>,
}

/// Result of `complete_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub score: u32,
    pub metrics: SessionMetrics,
    pub session: PracticeSession,
}

/// Collects corrections and timing data for one session.
#[derive(Debug, Default)]
pub struct FeedbackAccumulator {
    awaiting_reply_since: Option<DateTime<Utc>>,
    reply_latencies: Vec<Duration>,
    interruptions: u32,
    recoverable_errors: u32,
}

impl FeedbackAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A user turn was committed; start timing the tutor's reply.
    pub fn user_turn_committed(&mut self, at: DateTime<Utc>) {
        self.awaiting_reply_since = Some(at);
    }

    /// Record the tutor's corrections for the reply committed at `at`.
    ///
    /// Each correction becomes one feedback entry, tagged with the supplied
    /// kind or [`FeedbackKind::Grammar`]. Returns the new entries.
    pub fn record_reply(
        &mut self,
        session: &mut PracticeSession,
        corrections: &[Correction],
        at: DateTime<Utc>,
    ) -> CoreResult<Vec<SessionFeedback>> {
        if let Some(since) = self.awaiting_reply_since.take() {
            let latency = (at - since).to_std().unwrap_or_default();
            self.reply_latencies.push(latency);
        }

        let mut added = Vec::with_capacity(corrections.len());
        for correction in corrections {
            let entry = SessionFeedback {
                timestamp: at,
                kind: correction.kind.unwrap_or(FeedbackKind::Grammar),
                content: correction.error.clone(),
                suggestion: Some(correction.correction.clone()).filter(|s| !s.trim().is_empty()),
            };
            session.push_feedback(entry.clone())?;
            added.push(entry);
        }
        if !added.is_empty() {
            debug!("📝 Recorded {} correction(s)", added.len());
        }
        Ok(added)
    }

    /// A reply never arrived for the pending user turn.
    pub fn reply_abandoned(&mut self) {
        self.awaiting_reply_since = None;
    }

    pub fn record_interruption(&mut self) {
        self.interruptions += 1;
    }

    pub fn record_recoverable_error(&mut self) {
        self.recoverable_errors += 1;
    }

    /// Recompute metrics as of `now` (or the session's end time once finalized).
    pub fn metrics(&self, session: &PracticeSession, now: DateTime<Utc>) -> SessionMetrics {
        let end = session.end_time().unwrap_or(now);
        let elapsed = (end - session.start_time()).to_std().unwrap_or_default();

        let (user_turns, tutor_turns) =
            session
                .turns()
                .iter()
                .fold((0, 0), |(u, t), turn| match turn.speaker {
                    Speaker::User => (u + 1, t),
                    Speaker::Tutor => (u, t + 1),
                });

        let mut feedback_by_kind = BTreeMap::new();
        for entry in session.feedback() {
            *feedback_by_kind.entry(entry.kind).or_insert(0) += 1;
        }

        let average_reply_latency = if self.reply_latencies.is_empty() {
            None
        } else {
            let total: Duration = self.reply_latencies.iter().sum();
            Some(total / self.reply_latencies.len() as u32)
        };

        SessionMetrics {
            elapsed,
            minutes_practiced: minutes_practiced(session.start_time(), end),
            user_turns,
            tutor_turns,
            corrections: session.feedback().len(),
            feedback_by_kind,
            interruptions: self.interruptions,
            recoverable_errors: self.recoverable_errors,
            average_reply_latency,
        }
    }

    /// Finalize the session at `end`: set end time and score. Fails if already finalized.
    pub fn complete(
        &self,
        session: &mut PracticeSession,
        end: DateTime<Utc>,
    ) -> CoreResult<SessionOutcome> {
        let minutes = minutes_practiced(session.start_time(), end);
        let total = score(minutes, session.feedback().is_empty());
        session.finalize(end, total)?;
        info!(
            "🏁 Session {} complete: {} min, {} correction(s), score {}",
            session.id(),
            minutes,
            session.feedback().len(),
            total
        );
        Ok(SessionOutcome {
            score: total,
            metrics: self.metrics(session, end),
            session: session.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::model::LessonRef;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 12, 7, 0, 0).unwrap()
    }

    fn session() -> PracticeSession {
        PracticeSession::new(LessonRef::new("fr-1", "Bonjour", "French", "A1"), start())
    }

    #[test]
    fn twelve_clean_minutes_score_170() {
        let mut s = session();
        let acc = FeedbackAccumulator::new();
        let outcome = acc.complete(&mut s, start() + chrono::Duration::minutes(12)).unwrap();
        assert_eq!(outcome.score, 170);
        assert_eq!(outcome.metrics.minutes_practiced, 12);
    }

    #[test]
    fn partial_minutes_round_down() {
        assert_eq!(minutes_practiced(start(), start() + chrono::Duration::seconds(179)), 2);
        assert_eq!(minutes_practiced(start(), start() - chrono::Duration::seconds(5)), 0);
        assert_eq!(score(0, true), 50);
        assert_eq!(score(3, false), 30);
    }

    #[test]
    fn corrections_map_one_to_one() {
        let mut s = session();
        let mut acc = FeedbackAccumulator::new();
        s.append_turn(Speaker::User, "Je suis allé au magasin hier soir", None, start())
            .unwrap();
        acc.user_turn_committed(start());

        let at = start() + chrono::Duration::seconds(2);
        s.append_turn(Speaker::Tutor, "Très bien !", None, at).unwrap();
        let added = acc
            .record_reply(
                &mut s,
                &[
                    Correction::new("le magasin", "au magasin"),
                    Correction::new("soir", "soirée").with_kind(FeedbackKind::Vocabulary),
                ],
                at,
            )
            .unwrap();

        assert_eq!(added.len(), 2);
        assert_eq!(s.feedback()[0].kind, FeedbackKind::Grammar);
        assert_eq!(s.feedback()[1].kind, FeedbackKind::Vocabulary);
        assert_eq!(s.feedback()[1].suggestion.as_deref(), Some("soirée"));

        let m = acc.metrics(&s, at);
        assert_eq!(m.user_turns, 1);
        assert_eq!(m.tutor_turns, 1);
        assert_eq!(m.corrections, 2);
        assert_eq!(m.feedback_by_kind.get(&FeedbackKind::Grammar), Some(&1));
        assert_eq!(m.average_reply_latency, Some(Duration::from_secs(2)));

        let outcome = acc.complete(&mut s, start() + chrono::Duration::minutes(5)).unwrap();
        assert_eq!(outcome.score, 50);
    }

    #[test]
    fn complete_twice_fails() {
        let mut s = session();
        let acc = FeedbackAccumulator::new();
        acc.complete(&mut s, start() + chrono::Duration::minutes(1)).unwrap();
        assert!(matches!(
            acc.complete(&mut s, start() + chrono::Duration::minutes(2)),
            Err(CoreError::SessionFinalized)
        ));
        assert_eq!(s.score(), Some(60));
    }
}
