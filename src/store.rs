use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ClinicError, Result};
use crate::models::{Patient, Prediction, RiskCategory, SessionRecord, Therapist};

/// Everything the scoring and scheduling services read or write.
#[async_trait]
pub trait ClinicStore: Send + Sync {
    async fn patient(&self, id: Uuid) -> Result<Option<Patient>>;

    async fn therapist(&self, id: Uuid) -> Result<Option<Therapist>>;

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>>;

    async fn patients(&self) -> Result<Vec<Patient>>;

    /// All sessions of a patient, oldest first.
    async fn patient_sessions(&self, patient_id: Uuid) -> Result<Vec<SessionRecord>>;

    /// Sessions of a therapist whose start lies in `[from, to)`.
    async fn therapist_sessions_starting_between(
        &self,
        therapist_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>>;

    async fn insert_session(&self, session: &SessionRecord) -> Result<()>;

    async fn update_session(&self, session: &SessionRecord) -> Result<()>;

    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()>;

    async fn update_patient_risk(
        &self,
        patient_id: Uuid,
        risk_score: i32,
        risk_category: Option<RiskCategory>,
    ) -> Result<()>;

    /// Newest first.
    async fn patient_predictions(
        &self,
        patient_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Prediction>>;

    /// Dropout and risk-assessment predictions at or above `min_risk`,
    /// highest risk first.
    async fn high_risk_predictions(&self, min_risk: i32) -> Result<Vec<Prediction>>;
}

#[derive(Default)]
struct Tables {
    patients: HashMap<Uuid, Patient>,
    therapists: HashMap<Uuid, Therapist>,
    sessions: HashMap<Uuid, SessionRecord>,
    predictions: Vec<Prediction>,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_patient(&self, patient: Patient) {
        self.tables().patients.insert(patient.id, patient);
    }

    pub fn add_therapist(&self, therapist: Therapist) {
        self.tables().therapists.insert(therapist.id, therapist);
    }

    pub fn add_session(&self, session: SessionRecord) {
        self.tables().sessions.insert(session.id, session);
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.tables().predictions.clone()
    }
}

#[async_trait]
impl ClinicStore for MemoryStore {
    async fn patient(&self, id: Uuid) -> Result<Option<Patient>> {
        Ok(self.tables().patients.get(&id).cloned())
    }

    async fn therapist(&self, id: Uuid) -> Result<Option<Therapist>> {
        Ok(self.tables().therapists.get(&id).cloned())
    }

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self.tables().sessions.get(&id).cloned())
    }

    async fn patients(&self) -> Result<Vec<Patient>> {
        let mut patients: Vec<Patient> = self.tables().patients.values().cloned().collect();
        patients.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        Ok(patients)
    }

    async fn patient_sessions(&self, patient_id: Uuid) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .tables()
            .sessions
            .values()
            .filter(|session| session.patient_id == patient_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.scheduled_at);
        Ok(sessions)
    }

    async fn therapist_sessions_starting_between(
        &self,
        therapist_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        let mut sessions: Vec<SessionRecord> = self
            .tables()
            .sessions
            .values()
            .filter(|session| {
                session.therapist_id == therapist_id
                    && session.scheduled_at >= from
                    && session.scheduled_at < to
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.scheduled_at);
        Ok(sessions)
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.tables().sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        let mut tables = self.tables();
        match tables.sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(ClinicError::session_not_found(session.id)),
        }
    }

    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        self.tables().predictions.push(prediction.clone());
        Ok(())
    }

    async fn update_patient_risk(
        &self,
        patient_id: Uuid,
        risk_score: i32,
        risk_category: Option<RiskCategory>,
    ) -> Result<()> {
        let mut tables = self.tables();
        let patient = tables
            .patients
            .get_mut(&patient_id)
            .ok_or_else(|| ClinicError::patient_not_found(patient_id))?;
        patient.risk_score = Some(risk_score);
        if risk_category.is_some() {
            patient.risk_category = risk_category;
        }
        Ok(())
    }

    async fn patient_predictions(
        &self,
        patient_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Prediction>> {
        let mut predictions: Vec<Prediction> = self
            .tables()
            .predictions
            .iter()
            .rev()
            .filter(|prediction| prediction.patient_id == patient_id)
            .cloned()
            .collect();
        predictions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            predictions.truncate(limit);
        }
        Ok(predictions)
    }

    async fn high_risk_predictions(&self, min_risk: i32) -> Result<Vec<Prediction>> {
        let mut predictions: Vec<Prediction> = self
            .tables()
            .predictions
            .iter()
            .rev()
            .filter(|prediction| {
                prediction.prediction_type.refreshes_patient_risk()
                    && prediction.risk_level.is_some_and(|risk| risk >= min_risk)
            })
            .cloned()
            .collect();
        predictions.sort_by(|a, b| {
            b.risk_level
                .cmp(&a.risk_level)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::models::{Factors, PredictionType, SessionStatus};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn prediction(patient_id: Uuid, kind: PredictionType, risk: Option<i32>, hours: i64) -> Prediction {
        Prediction {
            id: Uuid::new_v4(),
            patient_id,
            prediction_type: kind,
            summary: String::new(),
            confidence: 0.7,
            factors: Factors::new(),
            recommendation: String::new(),
            risk_level: risk,
            risk_category: None,
            predicted_for: None,
            algorithm: "HeuristicFallback".to_string(),
            model_version: "fallback".to_string(),
            created_at: start() + Duration::hours(hours),
        }
    }

    #[tokio::test]
    async fn therapist_window_is_half_open() {
        let store = MemoryStore::new();
        let therapist = Uuid::new_v4();
        for minutes in [0, 30, 60] {
            let at = start() + Duration::minutes(minutes);
            store.add_session(SessionRecord::new(Uuid::new_v4(), therapist, at, 60, at));
        }
        let other = SessionRecord::new(Uuid::new_v4(), Uuid::new_v4(), start(), 60, start());
        store.add_session(other);

        let found = store
            .therapist_sessions_starting_between(therapist, start(), start() + Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s.therapist_id == therapist));
    }

    #[tokio::test]
    async fn predictions_list_newest_first_with_limit() {
        let store = MemoryStore::new();
        let patient = Uuid::new_v4();
        for hours in [1, 3, 2] {
            store
                .insert_prediction(&prediction(patient, PredictionType::DropoutRisk, Some(10), hours))
                .await
                .unwrap();
        }

        let latest = store.patient_predictions(patient, Some(2)).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].created_at, start() + Duration::hours(3));
        assert_eq!(latest[1].created_at, start() + Duration::hours(2));
    }

    #[tokio::test]
    async fn high_risk_ignores_progress_predictions() {
        let store = MemoryStore::new();
        let patient = Uuid::new_v4();
        store
            .insert_prediction(&prediction(patient, PredictionType::TreatmentProgress, Some(90), 1))
            .await
            .unwrap();
        store
            .insert_prediction(&prediction(patient, PredictionType::DropoutRisk, Some(55), 2))
            .await
            .unwrap();
        store
            .insert_prediction(&prediction(patient, PredictionType::DropoutRisk, Some(80), 3))
            .await
            .unwrap();
        store
            .insert_prediction(&prediction(patient, PredictionType::DropoutRisk, Some(20), 4))
            .await
            .unwrap();

        let risky = store.high_risk_predictions(50).await.unwrap();
        let levels: Vec<Option<i32>> = risky.iter().map(|p| p.risk_level).collect();
        assert_eq!(levels, vec![Some(80), Some(55)]);
    }

    #[tokio::test]
    async fn updating_missing_session_is_not_found() {
        let store = MemoryStore::new();
        let mut session = SessionRecord::new(Uuid::new_v4(), Uuid::new_v4(), start(), 60, start());
        session.status = SessionStatus::Confirmed;
        let err = store.update_session(&session).await.unwrap_err();
        assert!(matches!(err, ClinicError::NotFound { entity: "session", .. }));
    }
}
