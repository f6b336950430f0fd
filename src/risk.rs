use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::features::{self, SessionFeatures};
use crate::models::{Factors, Prediction, PredictionType, RiskCategory};
use crate::predictor::{self, DropoutRequest, ExternalPredictor, ModelScore};

pub const CANCELLATION_WEIGHT: f64 = 30.0;
pub const NO_SHOW_WEIGHT: f64 = 40.0;
/// Inactivity contributes linearly up to this many points.
pub const INACTIVITY_CAP: f64 = 30.0;
/// Days of inactivity that earn the full inactivity cap.
pub const INACTIVITY_HORIZON_DAYS: f64 = 30.0;
pub const MAX_RISK: f64 = 100.0;

pub const MODERATE_THRESHOLD: f64 = 25.0;
pub const HIGH_THRESHOLD: f64 = 50.0;
pub const CRITICAL_THRESHOLD: f64 = 75.0;

pub const LOCAL_CONFIDENCE: f64 = 0.7;
pub const LOCAL_ALGORITHM: &str = "HeuristicFallback";
pub const LOCAL_MODEL_VERSION: &str = "fallback";

/// Sent to the external model when the history has no recorded mood.
pub const DEFAULT_MOOD_SCORE: f64 = 5.0;
/// Sent to the external model when the patient has no date of birth.
pub const DEFAULT_AGE: i32 = 30;

pub fn local_dropout_risk(cancellation_rate: f64, no_show_rate: f64, days_since_last: f64) -> f64 {
    let inactivity =
        (days_since_last / INACTIVITY_HORIZON_DAYS * INACTIVITY_CAP).min(INACTIVITY_CAP);
    (cancellation_rate * CANCELLATION_WEIGHT + no_show_rate * NO_SHOW_WEIGHT + inactivity)
        .min(MAX_RISK)
}

pub fn risk_category(score: f64) -> RiskCategory {
    if score < MODERATE_THRESHOLD {
        RiskCategory::Low
    } else if score < HIGH_THRESHOLD {
        RiskCategory::Moderate
    } else if score < CRITICAL_THRESHOLD {
        RiskCategory::High
    } else {
        RiskCategory::Critical
    }
}

pub fn recommendation(category: RiskCategory) -> &'static str {
    match category {
        RiskCategory::Low => {
            "Continue the current treatment plan. The patient shows good engagement."
        }
        RiskCategory::Moderate => {
            "Consider scheduling a follow-up call. Review treatment goals with the patient."
        }
        RiskCategory::High => {
            "Urgent: contact the patient right away. Consider adjusting the therapeutic approach."
        }
        RiskCategory::Critical => {
            "Critical: immediate intervention required. Schedule an emergency consultation."
        }
    }
}

/// Wording shown to the patient rather than the therapist.
pub fn patient_recommendation(category: RiskCategory) -> &'static str {
    match category {
        RiskCategory::Low => {
            "Congratulations, you are on the right track. Keep attending your sessions regularly to hold on to your progress."
        }
        RiskCategory::Moderate => {
            "Your commitment matters for your well-being. Reach out to your therapist if keeping appointments gets difficult."
        }
        RiskCategory::High => {
            "We noticed a few missed sessions. Your health is our priority, so get back in touch with your therapist to talk about what you need."
        }
        RiskCategory::Critical => {
            "We are here to help. Returning to your sessions is essential; contact us so we can adapt the treatment to your situation."
        }
    }
}

pub fn local_dropout_score(features: &SessionFeatures) -> ModelScore {
    let cancellation_impact = features.cancellation_rate * CANCELLATION_WEIGHT;
    let no_show_impact = features.no_show_rate * NO_SHOW_WEIGHT;
    let inactivity_impact = (features.days_since_last_session / INACTIVITY_HORIZON_DAYS
        * INACTIVITY_CAP)
        .min(INACTIVITY_CAP);

    let mut factors = Factors::new();
    factors.insert("cancellation_impact".to_string(), cancellation_impact);
    factors.insert("no_show_impact".to_string(), no_show_impact);
    factors.insert("inactivity_impact".to_string(), inactivity_impact);

    ModelScore {
        score: local_dropout_risk(
            features.cancellation_rate,
            features.no_show_rate,
            features.days_since_last_session,
        ),
        confidence: LOCAL_CONFIDENCE,
        factors,
        model_version: LOCAL_MODEL_VERSION.to_string(),
        algorithm: LOCAL_ALGORITHM.to_string(),
    }
}

pub fn dropout_request(features: &SessionFeatures, age: Option<i32>) -> DropoutRequest {
    DropoutRequest {
        cancellation_rate: features.cancellation_rate,
        no_show_rate: features.no_show_rate,
        days_since_last_session: features.days_since_last_session as i64,
        total_sessions: features.total_sessions,
        avg_mood_score: features.avg_mood_after.unwrap_or(DEFAULT_MOOD_SCORE),
        age: age.unwrap_or(DEFAULT_AGE),
    }
}

/// External model first when one is configured, local heuristic otherwise.
pub async fn score_dropout(
    features: &SessionFeatures,
    age: Option<i32>,
    predictor: Option<&dyn ExternalPredictor>,
) -> ModelScore {
    let external = match predictor {
        Some(predictor) => {
            let request = dropout_request(features, age);
            predictor::accept("dropout-risk", predictor.dropout_risk(&request).await)
        }
        None => None,
    };

    external.unwrap_or_else(|| local_dropout_score(features))
}

pub fn dropout_prediction(
    patient_id: Uuid,
    features: &SessionFeatures,
    score: ModelScore,
    now: DateTime<Utc>,
) -> Prediction {
    let risk = score.score.clamp(0.0, MAX_RISK);
    let category = risk_category(risk);

    let observed = features.to_factors();
    let mut factors = Factors::new();
    for key in [
        features::CANCELLATION_RATE,
        features::NO_SHOW_RATE,
        features::DAYS_SINCE_LAST_SESSION,
        features::TOTAL_SESSIONS,
    ] {
        if let Some(value) = observed.get(key) {
            factors.insert(key.to_string(), *value);
        }
    }
    factors.extend(score.factors);

    Prediction {
        id: Uuid::new_v4(),
        patient_id,
        prediction_type: PredictionType::DropoutRisk,
        summary: format!(
            "Dropout risk {:.1}/100 ({}) assessed with {}",
            risk, category, score.algorithm
        ),
        confidence: score.confidence.clamp(0.0, 1.0),
        factors,
        recommendation: recommendation(category).to_string(),
        risk_level: Some(risk.trunc() as i32),
        risk_category: Some(category),
        predicted_for: None,
        algorithm: score.algorithm,
        model_version: score.model_version,
        created_at: now,
    }
}
