use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::features::{self, SessionFeatures};
use crate::models::{Factors, Prediction, PredictionType};
use crate::predictor::{self, ExternalPredictor, ModelScore, NextSessionRequest};
use crate::risk;

pub const DEFAULT_GAP_DAYS: i64 = 7;
/// Fixed; not derived from the data.
pub const LOCAL_CONFIDENCE: f64 = 0.82;
pub const LOCAL_ALGORITHM: &str = "SessionScheduler";
pub const LOCAL_MODEL_VERSION: &str = "1.0.0";

const DEFAULT_RISK_LEVEL: i32 = 25;
const DEFAULT_PROGRESS_RATING: f64 = 3.0;

/// Historical cadence rounded to whole days, weekly without a cadence.
/// Same-day sessions give a gap of 0.
pub fn local_gap_days(features: &SessionFeatures) -> i64 {
    features
        .avg_days_between_sessions
        .map(|avg| avg.round() as i64)
        .unwrap_or(DEFAULT_GAP_DAYS)
}

pub fn next_session_request(
    features: &SessionFeatures,
    current_risk: Option<i32>,
    age: Option<i32>,
) -> NextSessionRequest {
    NextSessionRequest {
        avg_days_between_sessions: features
            .avg_days_between_sessions
            .unwrap_or(DEFAULT_GAP_DAYS as f64),
        current_risk_level: current_risk.unwrap_or(DEFAULT_RISK_LEVEL),
        last_progress_rating: features
            .last_progress_rating
            .map(f64::from)
            .unwrap_or(DEFAULT_PROGRESS_RATING),
        patient_age: age.unwrap_or(risk::DEFAULT_AGE),
    }
}

pub async fn plan_next_session(
    features: &SessionFeatures,
    current_risk: Option<i32>,
    age: Option<i32>,
    predictor: Option<&dyn ExternalPredictor>,
) -> ModelScore {
    let external = match predictor {
        Some(predictor) => {
            let request = next_session_request(features, current_risk, age);
            predictor::accept("next-session", predictor.next_session(&request).await)
        }
        None => None,
    };

    external.unwrap_or_else(|| ModelScore {
        score: local_gap_days(features) as f64,
        confidence: LOCAL_CONFIDENCE,
        factors: Factors::new(),
        model_version: LOCAL_MODEL_VERSION.to_string(),
        algorithm: LOCAL_ALGORITHM.to_string(),
    })
}

/// Carries no risk level: next-session predictions never touch the
/// patient's cached risk fields.
pub fn next_session_prediction(
    patient_id: Uuid,
    features: &SessionFeatures,
    age: Option<i32>,
    score: ModelScore,
    now: DateTime<Utc>,
) -> Prediction {
    let gap_days = score.score.round() as i64;

    let observed = features.to_factors();
    let mut factors = Factors::new();
    for key in [features::TOTAL_SESSIONS, features::AVG_DAYS_BETWEEN_SESSIONS] {
        if let Some(value) = observed.get(key) {
            factors.insert(key.to_string(), *value);
        }
    }
    if let Some(age) = age {
        factors.insert("age".to_string(), f64::from(age));
    }
    factors.insert("recommended_days".to_string(), gap_days as f64);
    factors.extend(score.factors);

    Prediction {
        id: Uuid::new_v4(),
        patient_id,
        prediction_type: PredictionType::NextSessionNeeded,
        summary: format!("Next session recommended in {gap_days} days"),
        confidence: score.confidence.clamp(0.0, 1.0),
        factors,
        recommendation: "Schedule next session for optimal treatment continuity".to_string(),
        risk_level: None,
        risk_category: None,
        predicted_for: Some(now + Duration::days(gap_days)),
        algorithm: score.algorithm,
        model_version: score.model_version,
        created_at: now,
    }
}
