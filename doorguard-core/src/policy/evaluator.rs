use crate::data_structures::{GlobalSchedule, User, UserScheduleWindow};
use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessDecision {
    AllowNoOtp,
    AllowWithOtp,
    Deny,
}

/// Which rule produced a decision. Carried alongside the decision for audit
/// and logging only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecisionRule {
    UserDisallowed,
    ForceUnlocked,
    GlobalWindow,
    UserWindow,
    NoWindow,
}

/// Immutable schedule snapshot the decision is evaluated against.
#[derive(Clone, Debug, Default)]
pub struct AccessPolicy {
    pub schedule: GlobalSchedule,
    pub windows: Vec<UserScheduleWindow>,
}

fn gated(user: &User) -> AccessDecision {
    if user.low_security {
        AccessDecision::AllowNoOtp
    } else {
        AccessDecision::AllowWithOtp
    }
}

impl AccessPolicy {
    pub fn new(schedule: GlobalSchedule, windows: Vec<UserScheduleWindow>) -> Self {
        AccessPolicy { schedule, windows }
    }

    pub fn decide(&self, user: &User, now: NaiveDateTime) -> AccessDecision {
        self.decide_with_rule(user, now).0
    }

    /// Evaluates the rules in order; the first one that applies wins.
    /// `now` is site-local wall time.
    pub fn decide_with_rule(&self, user: &User, now: NaiveDateTime) -> (AccessDecision, DecisionRule) {
        if !user.is_allowed {
            return (AccessDecision::Deny, DecisionRule::UserDisallowed);
        }

        let today = self.schedule.entry(now.weekday());
        if today.map_or(false, |e| e.force_unlocked) {
            return (AccessDecision::AllowNoOtp, DecisionRule::ForceUnlocked);
        }

        if today.map_or(false, |e| e.contains(now.time())) {
            return (gated(user), DecisionRule::GlobalWindow);
        }

        let date = now.date();
        if self.windows.iter().any(|w| w.user_id == user.id && w.contains(date)) {
            return (gated(user), DecisionRule::UserWindow);
        }

        (AccessDecision::Deny, DecisionRule::NoWindow)
    }
}
