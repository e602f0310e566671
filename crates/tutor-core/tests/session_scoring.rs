//! Integration test: end-of-session scoring and progress bookkeeping through
//! the public API, with a manual clock and an on-disk Sled preference store.

use chrono::{TimeZone, Utc};
use tutor_core::{
    Clock, Correction, FeedbackAccumulator, FeedbackKind, LearnerProgress, LessonRef,
    ManualClock, PracticeSession, ProgressStore, SledStore, Speaker,
};

fn lesson() -> LessonRef {
    LessonRef::new("de-bakery", "Beim Bäcker", "German", "A2")
}

#[test]
fn clean_twelve_minute_session_scores_170() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 14, 8, 0, 0).unwrap());
    let mut session = PracticeSession::new(lesson(), clock.now());
    let acc = FeedbackAccumulator::new();

    clock.advance(chrono::Duration::minutes(12));
    let outcome = acc.complete(&mut session, clock.now()).unwrap();

    assert_eq!(outcome.score, 170);
    assert_eq!(outcome.session.end_time(), Some(clock.now()));
    assert_eq!(outcome.metrics.minutes_practiced, 12);
}

#[test]
fn score_formula_holds_with_feedback() {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 14, 8, 0, 0).unwrap());
    let mut session = PracticeSession::new(lesson(), clock.now());
    let mut acc = FeedbackAccumulator::new();

    for (said, fix) in [("Ich habe gegangen", "Ich bin gegangen"), ("das Brot ist lecker", "")] {
        clock.advance(chrono::Duration::seconds(40));
        session.append_turn(Speaker::User, said, None, clock.now()).unwrap();
        acc.user_turn_committed(clock.now());
        clock.advance(chrono::Duration::seconds(3));
        session
            .append_turn(Speaker::Tutor, "Gut!", Some("Good!".into()), clock.now())
            .unwrap();
        let corrections: Vec<Correction> = if fix.is_empty() {
            Vec::new()
        } else {
            vec![Correction::new(said, fix)]
        };
        acc.record_reply(&mut session, &corrections, clock.now()).unwrap();
    }

    clock.advance(chrono::Duration::seconds(300));
    let outcome = acc.complete(&mut session, clock.now()).unwrap();
    let expected_minutes = (40 + 3 + 40 + 3 + 300) / 60;
    assert_eq!(outcome.metrics.minutes_practiced, expected_minutes);
    assert_eq!(outcome.score, expected_minutes * 10);
    assert_eq!(outcome.metrics.corrections, 1);
    assert_eq!(
        outcome.metrics.feedback_by_kind.get(&FeedbackKind::Grammar),
        Some(&1)
    );

    let turns = outcome.session.turns();
    assert_eq!(turns.first().map(|t| t.speaker), Some(Speaker::User));
    assert!(turns.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(turns.windows(2).all(|w| w[0].speaker != w[1].speaker));
}

#[test]
fn ten_minute_session_updates_persisted_progress() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::open_path(dir.path().join("prefs")).unwrap();
    store
        .save_progress(&LearnerProgress {
            daily_goal_minutes: 15,
            today_minutes: 8,
            streak_days: 3,
            last_activity_date: Some(chrono::NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()),
        })
        .unwrap();

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 14, 19, 0, 0).unwrap());
    let mut session = PracticeSession::new(lesson(), clock.now());
    clock.advance(chrono::Duration::minutes(10));
    let outcome = FeedbackAccumulator::new()
        .complete(&mut session, clock.now())
        .unwrap();

    let mut progress = store.load_progress().unwrap();
    progress.record_practice(outcome.metrics.minutes_practiced, clock.today());
    // A second session the same day must not touch the streak again.
    progress.record_practice(0, clock.today());
    store.save_progress(&progress).unwrap();

    let progress = store.load_progress().unwrap();
    assert_eq!(progress.today_minutes, 18);
    assert_eq!(progress.streak_days, 4);
    assert!(progress.goal_met());
}
