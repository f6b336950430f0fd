use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClinicError;

/// Named numeric inputs of one scoring run, keyed by feature name.
pub type Factors = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl SessionStatus {
    pub const ALL: [SessionStatus; 7] = [
        SessionStatus::Scheduled,
        SessionStatus::Confirmed,
        SessionStatus::InProgress,
        SessionStatus::Completed,
        SessionStatus::Cancelled,
        SessionStatus::NoShow,
        SessionStatus::Rescheduled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::Confirmed => "CONFIRMED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::NoShow => "NO_SHOW",
            SessionStatus::Rescheduled => "RESCHEDULED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::NoShow
        )
    }

    /// Whether the session still occupies a slot in the therapist's calendar.
    pub fn blocks_calendar(self) -> bool {
        self != SessionStatus::Cancelled
    }

    /// Transitions reachable through a plain status update.
    ///
    /// `Rescheduled` is never a target here; only a reschedule enters it.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        match (self, next) {
            (Scheduled | Rescheduled, Confirmed) => true,
            (Scheduled | Confirmed | Rescheduled, InProgress | Cancelled | NoShow) => true,
            (InProgress, Completed) => true,
            _ => false,
        }
    }

    pub fn can_reschedule(self) -> bool {
        matches!(
            self,
            SessionStatus::Scheduled | SessionStatus::Confirmed | SessionStatus::Rescheduled
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ClinicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        SessionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ClinicError::InvalidInput(format!("unknown session status '{value}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub therapist_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: SessionStatus,
    pub mood_before: Option<i32>,
    pub mood_after: Option<i32>,
    pub progress_rating: Option<i32>,
    pub notes: Option<String>,
    pub therapist_notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        patient_id: Uuid,
        therapist_id: Uuid,
        scheduled_at: DateTime<Utc>,
        duration_minutes: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        SessionRecord {
            id: Uuid::new_v4(),
            patient_id,
            therapist_id,
            scheduled_at,
            duration_minutes,
            status: SessionStatus::Scheduled,
            mood_before: None,
            mood_after: None,
            progress_rating: None,
            notes: None,
            therapist_notes: None,
            started_at: None,
            ended_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            reminder_sent: false,
            created_at,
        }
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + Duration::minutes(i64::from(self.duration_minutes.max(0)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub date_of_birth: Option<NaiveDate>,
    /// Cached from the latest dropout/risk prediction. The prediction log is
    /// authoritative; these two fields may lag behind it.
    pub risk_score: Option<i32>,
    pub risk_category: Option<RiskCategory>,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    /// Age in calendar years, counted by birth year only.
    pub fn age_on(&self, today: NaiveDate) -> Option<i32> {
        self.date_of_birth
            .map(|dob| (today.year() - dob.year()).max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Therapist {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredictionType {
    NextSessionNeeded,
    TreatmentProgress,
    RiskAssessment,
    OptimalSchedule,
    SessionOutcome,
    DropoutRisk,
    TreatmentDuration,
}

impl PredictionType {
    pub const ALL: [PredictionType; 7] = [
        PredictionType::NextSessionNeeded,
        PredictionType::TreatmentProgress,
        PredictionType::RiskAssessment,
        PredictionType::OptimalSchedule,
        PredictionType::SessionOutcome,
        PredictionType::DropoutRisk,
        PredictionType::TreatmentDuration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PredictionType::NextSessionNeeded => "NEXT_SESSION_NEEDED",
            PredictionType::TreatmentProgress => "TREATMENT_PROGRESS",
            PredictionType::RiskAssessment => "RISK_ASSESSMENT",
            PredictionType::OptimalSchedule => "OPTIMAL_SCHEDULE",
            PredictionType::SessionOutcome => "SESSION_OUTCOME",
            PredictionType::DropoutRisk => "DROPOUT_RISK",
            PredictionType::TreatmentDuration => "TREATMENT_DURATION",
        }
    }

    /// Only these prediction types feed the patient's cached risk fields.
    pub fn refreshes_patient_risk(self) -> bool {
        matches!(
            self,
            PredictionType::DropoutRisk | PredictionType::RiskAssessment
        )
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PredictionType {
    type Err = ClinicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        PredictionType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| ClinicError::InvalidInput(format!("unknown prediction type '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskCategory {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 4] = [
        RiskCategory::Low,
        RiskCategory::Moderate,
        RiskCategory::High,
        RiskCategory::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RiskCategory::Low => "LOW",
            RiskCategory::Moderate => "MODERATE",
            RiskCategory::High => "HIGH",
            RiskCategory::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskCategory {
    type Err = ClinicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        RiskCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == value.trim().to_ascii_uppercase())
            .ok_or_else(|| ClinicError::InvalidInput(format!("unknown risk category '{value}'")))
    }
}

/// One scoring run. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub prediction_type: PredictionType,
    pub summary: String,
    pub confidence: f64,
    pub factors: Factors,
    pub recommendation: String,
    pub risk_level: Option<i32>,
    pub risk_category: Option<RiskCategory>,
    pub predicted_for: Option<DateTime<Utc>>,
    pub algorithm: String,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_loosely() {
        assert_eq!("no-show".parse::<SessionStatus>().unwrap(), SessionStatus::NoShow);
        assert_eq!("in progress".parse::<SessionStatus>().unwrap(), SessionStatus::InProgress);
        assert_eq!("COMPLETED".parse::<SessionStatus>().unwrap(), SessionStatus::Completed);
        assert!("finished".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn lifecycle_follows_expected_edges() {
        use SessionStatus::*;

        assert!(Scheduled.can_transition_to(Confirmed));
        assert!(Scheduled.can_transition_to(Cancelled));
        assert!(Scheduled.can_transition_to(NoShow));
        assert!(Confirmed.can_transition_to(InProgress));
        assert!(Rescheduled.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));

        assert!(!Scheduled.can_transition_to(Rescheduled));
        assert!(!Scheduled.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!NoShow.can_transition_to(InProgress));
    }

    #[test]
    fn only_live_sessions_can_be_rescheduled() {
        assert!(SessionStatus::Scheduled.can_reschedule());
        assert!(SessionStatus::Rescheduled.can_reschedule());
        assert!(!SessionStatus::InProgress.can_reschedule());
        assert!(!SessionStatus::Completed.can_reschedule());
    }

    #[test]
    fn session_end_follows_duration() {
        let start = Utc::now();
        let session = SessionRecord::new(Uuid::new_v4(), Uuid::new_v4(), start, 50, start);
        assert_eq!(session.ends_at(), start + Duration::minutes(50));
        assert!(session.ends_at() >= session.scheduled_at);
    }

    #[test]
    fn age_uses_birth_year() {
        let patient = Patient {
            id: Uuid::new_v4(),
            full_name: "Noa Ferris".to_string(),
            email: "noa@example.com".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 11, 2),
            risk_score: None,
            risk_category: None,
            created_at: Utc::now(),
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert_eq!(patient.age_on(today), Some(36));
    }
}
