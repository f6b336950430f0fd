//! Aggregate features derived from a patient's session history.

use chrono::{DateTime, Utc};

use crate::models::{Factors, SessionRecord, SessionStatus};

pub const TOTAL_SESSIONS: &str = "total_sessions";
pub const CANCELLATION_RATE: &str = "cancellation_rate";
pub const NO_SHOW_RATE: &str = "no_show_rate";
pub const DAYS_SINCE_LAST_SESSION: &str = "days_since_last_session";
pub const AVG_DAYS_BETWEEN_SESSIONS: &str = "avg_days_between_sessions";
pub const AVERAGE_PROGRESS: &str = "average_progress";
pub const MOOD_IMPROVEMENT: &str = "mood_improvement";

/// Used for `days_since_last_session` when nothing has been completed yet.
pub const DEFAULT_DAYS_SINCE_LAST_SESSION: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionFeatures {
    pub total_sessions: usize,
    pub completed_sessions: usize,
    pub cancellation_rate: f64,
    pub no_show_rate: f64,
    pub days_since_last_session: f64,
    /// Present only with at least two sessions.
    pub avg_days_between_sessions: Option<f64>,
    pub average_progress: Option<f64>,
    pub mood_improvement: f64,
    pub avg_mood_after: Option<f64>,
    pub last_progress_rating: Option<i32>,
}

impl SessionFeatures {
    pub fn completion_rate(&self) -> f64 {
        ratio(self.completed_sessions, self.total_sessions)
    }

    /// The feature map recorded on a prediction. Absent optional features are
    /// left out rather than zero-filled, except `average_progress` which the
    /// progress formula reads as 0.
    pub fn to_factors(&self) -> Factors {
        let mut factors = Factors::new();
        factors.insert(TOTAL_SESSIONS.to_string(), self.total_sessions as f64);
        factors.insert(CANCELLATION_RATE.to_string(), self.cancellation_rate);
        factors.insert(NO_SHOW_RATE.to_string(), self.no_show_rate);
        factors.insert(
            DAYS_SINCE_LAST_SESSION.to_string(),
            self.days_since_last_session,
        );
        if let Some(avg) = self.avg_days_between_sessions {
            factors.insert(AVG_DAYS_BETWEEN_SESSIONS.to_string(), avg);
        }
        factors.insert(
            AVERAGE_PROGRESS.to_string(),
            self.average_progress.unwrap_or(0.0),
        );
        factors.insert(MOOD_IMPROVEMENT.to_string(), self.mood_improvement);
        factors
    }
}

pub fn aggregate(sessions: &[SessionRecord], now: DateTime<Utc>) -> SessionFeatures {
    let total = sessions.len();
    let count_status = |status: SessionStatus| {
        sessions
            .iter()
            .filter(|session| session.status == status)
            .count()
    };

    let mut ordered: Vec<&SessionRecord> = sessions.iter().collect();
    ordered.sort_by_key(|session| session.scheduled_at);

    let completed: Vec<&SessionRecord> = ordered
        .iter()
        .copied()
        .filter(|session| session.status == SessionStatus::Completed)
        .collect();

    SessionFeatures {
        total_sessions: total,
        completed_sessions: completed.len(),
        cancellation_rate: ratio(count_status(SessionStatus::Cancelled), total),
        no_show_rate: ratio(count_status(SessionStatus::NoShow), total),
        days_since_last_session: days_since_last_completed(&completed, now),
        avg_days_between_sessions: average_gap_days(&ordered),
        average_progress: mean(completed.iter().filter_map(|s| s.progress_rating.map(f64::from))),
        mood_improvement: mean(completed.iter().filter_map(|s| match (s.mood_before, s.mood_after) {
            (Some(before), Some(after)) => Some(f64::from(after - before)),
            _ => None,
        }))
        .unwrap_or(0.0),
        avg_mood_after: mean(completed.iter().filter_map(|s| s.mood_after.map(f64::from))),
        last_progress_rating: completed.iter().rev().find_map(|s| s.progress_rating),
    }
}

fn days_since_last_completed(completed: &[&SessionRecord], now: DateTime<Utc>) -> f64 {
    match completed.last() {
        Some(last) => (now - last.scheduled_at).num_days().max(0) as f64,
        None => DEFAULT_DAYS_SINCE_LAST_SESSION,
    }
}

// Each gap is counted in whole days before averaging.
fn average_gap_days(ordered: &[&SessionRecord]) -> Option<f64> {
    if ordered.len() < 2 {
        return None;
    }

    let total: i64 = ordered
        .windows(2)
        .map(|pair| (pair[1].scheduled_at - pair[0].scheduled_at).num_days())
        .sum();
    Some(total as f64 / (ordered.len() - 1) as f64)
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}
