//! Scoring requests: load history, aggregate, score, append to the
//! prediction log, refresh the patient's cached risk fields.

use std::sync::Arc;

use log::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{ClinicError, Result};
use crate::features;
use crate::models::{Patient, Prediction, PredictionType, SessionRecord, SessionStatus};
use crate::planner;
use crate::predictor::{ExternalPredictor, PredictorError};
use crate::progress::{self, ProgressBand};
use crate::risk;
use crate::store::ClinicStore;

#[derive(Clone)]
pub struct ScoringService {
    store: Arc<dyn ClinicStore>,
    predictor: Option<Arc<dyn ExternalPredictor>>,
    clock: Arc<dyn Clock>,
}

impl ScoringService {
    pub fn new(
        store: Arc<dyn ClinicStore>,
        predictor: Option<Arc<dyn ExternalPredictor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        ScoringService {
            store,
            predictor,
            clock,
        }
    }

    async fn load_patient(&self, patient_id: Uuid) -> Result<Patient> {
        self.store
            .patient(patient_id)
            .await?
            .ok_or_else(|| ClinicError::patient_not_found(patient_id))
    }

    fn patient_age(&self, patient: &Patient) -> Option<i32> {
        patient.age_on(self.clock.now().date_naive())
    }

    pub async fn dropout_risk(&self, patient_id: Uuid) -> Result<Prediction> {
        let patient = self.load_patient(patient_id).await?;
        let sessions = self.store.patient_sessions(patient_id).await?;
        let now = self.clock.now();

        let features = features::aggregate(&sessions, now);
        let age = self.patient_age(&patient);
        let score = risk::score_dropout(&features, age, self.predictor.as_deref()).await;
        let prediction = risk::dropout_prediction(patient_id, &features, score, now);

        self.record(prediction).await
    }

    pub async fn treatment_progress(&self, patient_id: Uuid) -> Result<Prediction> {
        self.load_patient(patient_id).await?;
        let sessions = self.store.patient_sessions(patient_id).await?;
        let now = self.clock.now();

        let completed = completed_only(&sessions);
        let features = features::aggregate(&completed, now);
        let completion_rate = features::aggregate(&sessions, now).completion_rate();
        let score =
            progress::score_progress(&features, completion_rate, self.predictor.as_deref()).await;
        let prediction = progress::progress_prediction(patient_id, &features, score, now);

        self.record(prediction).await
    }

    /// Cadence comes from completed sessions only; cancelled and missed
    /// slots do not count toward the gap between visits.
    pub async fn next_session(&self, patient_id: Uuid) -> Result<Prediction> {
        let patient = self.load_patient(patient_id).await?;
        let sessions = self.store.patient_sessions(patient_id).await?;
        let now = self.clock.now();

        let completed = completed_only(&sessions);
        let features = features::aggregate(&completed, now);
        let age = self.patient_age(&patient);
        let score = planner::plan_next_session(
            &features,
            patient.risk_score,
            age,
            self.predictor.as_deref(),
        )
        .await;
        let prediction = planner::next_session_prediction(patient_id, &features, age, score, now);

        self.record(prediction).await
    }

    pub async fn patient_predictions(
        &self,
        patient_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Prediction>> {
        self.load_patient(patient_id).await?;
        self.store.patient_predictions(patient_id, limit).await
    }

    pub async fn high_risk_predictions(&self, min_risk: i32) -> Result<Vec<Prediction>> {
        self.store.high_risk_predictions(min_risk).await
    }

    /// `None` when no external predictor is configured.
    pub async fn predictor_health(&self) -> Option<std::result::Result<(), PredictorError>> {
        match &self.predictor {
            Some(predictor) => Some(predictor.health().await),
            None => None,
        }
    }

    // The cache is refreshed after the log write; a crash between the two
    // leaves the cache one prediction behind the log.
    async fn record(&self, prediction: Prediction) -> Result<Prediction> {
        self.store.insert_prediction(&prediction).await?;
        info!(
            "patient {}: {} recorded ({}, {})",
            prediction.patient_id,
            prediction.prediction_type,
            prediction.algorithm,
            prediction.summary
        );

        if prediction.prediction_type.refreshes_patient_risk() {
            if let Some(risk_level) = prediction.risk_level {
                self.store
                    .update_patient_risk(prediction.patient_id, risk_level, prediction.risk_category)
                    .await?;
                debug!(
                    "patient {}: cached risk set to {risk_level}",
                    prediction.patient_id
                );
            }
        }

        Ok(prediction)
    }
}

fn completed_only(sessions: &[SessionRecord]) -> Vec<SessionRecord> {
    sessions
        .iter()
        .filter(|session| session.status == SessionStatus::Completed)
        .cloned()
        .collect()
}

/// Patient-facing wording for a stored prediction.
pub fn patient_message(prediction: &Prediction) -> &'static str {
    match (prediction.prediction_type, prediction.risk_category, prediction.risk_level) {
        (PredictionType::DropoutRisk, Some(category), _) => risk::patient_recommendation(category),
        (PredictionType::TreatmentProgress, _, Some(inverse)) => {
            ProgressBand::from_score(f64::from(100 - inverse)).patient_recommendation()
        }
        _ => "Keep up your therapy. Every session contributes to your well-being.",
    }
}
