//! Learner progress: daily practice goal and streak.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Persisted progress counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerProgress {
    pub daily_goal_minutes: u32,
    pub today_minutes: u32,
    pub streak_days: u32,
    pub last_activity_date: Option<NaiveDate>,
}

impl Default for LearnerProgress {
    fn default() -> Self {
        Self {
            daily_goal_minutes: 15,
            today_minutes: 0,
            streak_days: 0,
            last_activity_date: None,
        }
    }
}

impl LearnerProgress {
    /// Add practiced minutes for `today`. The streak grows by one the first
    /// time this is called on a new calendar day and never more than once a day.
    /// Returns true if the streak grew.
    pub fn record_practice(&mut self, minutes: u32, today: NaiveDate) -> bool {
        self.today_minutes = self.today_minutes.saturating_add(minutes);
        let new_day = self.last_activity_date != Some(today);
        if new_day {
            self.streak_days = self.streak_days.saturating_add(1);
            self.last_activity_date = Some(today);
            info!("🔥 Streak extended to {} day(s)", self.streak_days);
        }
        new_day
    }

    pub fn goal_met(&self) -> bool {
        self.today_minutes >= self.daily_goal_minutes
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.daily_goal_minutes.saturating_sub(self.today_minutes)
    }
}
