use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::features::{self, SessionFeatures};
use crate::models::{Factors, Prediction, PredictionType};
use crate::predictor::{self, ExternalPredictor, ModelScore, ProgressRequest};

pub const BASE_SCORE: f64 = 50.0;
pub const PROGRESS_WEIGHT: f64 = 5.0;
pub const MOOD_WEIGHT: f64 = 10.0;
pub const SESSION_WEIGHT: f64 = 2.0;
pub const SESSION_BONUS_CAP: f64 = 20.0;

pub const EXCELLENT_THRESHOLD: f64 = 80.0;
pub const GOOD_THRESHOLD: f64 = 60.0;
pub const MODERATE_THRESHOLD: f64 = 40.0;

/// Fixed; not derived from the data.
pub const LOCAL_CONFIDENCE: f64 = 0.78;
pub const LOCAL_ALGORITHM: &str = "ProgressAnalyzer";
pub const LOCAL_MODEL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressBand {
    Excellent,
    Good,
    Moderate,
    NeedsAttention,
}

impl ProgressBand {
    pub fn from_score(score: f64) -> Self {
        if score >= EXCELLENT_THRESHOLD {
            ProgressBand::Excellent
        } else if score >= GOOD_THRESHOLD {
            ProgressBand::Good
        } else if score >= MODERATE_THRESHOLD {
            ProgressBand::Moderate
        } else {
            ProgressBand::NeedsAttention
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProgressBand::Excellent => "Excellent",
            ProgressBand::Good => "Good",
            ProgressBand::Moderate => "Moderate",
            ProgressBand::NeedsAttention => "Needs Attention",
        }
    }

    pub fn recommendation(self) -> &'static str {
        match self {
            ProgressBand::Excellent => {
                "Excellent progress. Consider moving towards the maintenance phase."
            }
            ProgressBand::Good => "Good progress. Continue the current therapeutic approach.",
            ProgressBand::Moderate => {
                "Moderate progress. Consider adjusting the intensity or approach of treatment."
            }
            ProgressBand::NeedsAttention => {
                "Progress needs attention. A full treatment review is recommended."
            }
        }
    }

    pub fn patient_recommendation(self) -> &'static str {
        match self {
            ProgressBand::Excellent => {
                "Excellent work! Your progress is remarkable, keep it up."
            }
            ProgressBand::Good => {
                "You are progressing well. Every session counts and you are making real progress."
            }
            ProgressBand::Moderate => {
                "Keep going; feeling better takes time. Talk about your difficulties with your therapist."
            }
            ProgressBand::NeedsAttention => {
                "Don't be discouraged. Speak openly with your therapist so the treatment can be adapted."
            }
        }
    }
}

/// `features` must be aggregated over completed sessions only.
pub fn local_progress_score(features: &SessionFeatures) -> f64 {
    let score = BASE_SCORE
        + features.average_progress.unwrap_or(0.0) * PROGRESS_WEIGHT
        + features.mood_improvement * MOOD_WEIGHT
        + (features.total_sessions as f64 * SESSION_WEIGHT).min(SESSION_BONUS_CAP);
    score.clamp(0.0, 100.0)
}

pub fn progress_request(features: &SessionFeatures, completion_rate: f64) -> ProgressRequest {
    ProgressRequest {
        total_sessions: features.total_sessions,
        avg_progress_rating: features.average_progress.unwrap_or(0.0),
        mood_improvement: features.mood_improvement,
        session_completion_rate: completion_rate,
    }
}

pub async fn score_progress(
    features: &SessionFeatures,
    completion_rate: f64,
    predictor: Option<&dyn ExternalPredictor>,
) -> ModelScore {
    let external = match predictor {
        Some(predictor) => {
            let request = progress_request(features, completion_rate);
            predictor::accept(
                "treatment-progress",
                predictor.treatment_progress(&request).await,
            )
        }
        None => None,
    };

    external.unwrap_or_else(|| ModelScore {
        score: local_progress_score(features),
        confidence: LOCAL_CONFIDENCE,
        factors: Factors::new(),
        model_version: LOCAL_MODEL_VERSION.to_string(),
        algorithm: LOCAL_ALGORITHM.to_string(),
    })
}

/// The band label only appears in the summary text. `risk_level` holds the
/// inverse of the progress score and no category is assigned.
pub fn progress_prediction(
    patient_id: Uuid,
    features: &SessionFeatures,
    score: ModelScore,
    now: DateTime<Utc>,
) -> Prediction {
    let progress = score.score.clamp(0.0, 100.0);
    let band = ProgressBand::from_score(progress);

    let observed = features.to_factors();
    let mut factors = Factors::new();
    for key in [
        features::TOTAL_SESSIONS,
        features::AVERAGE_PROGRESS,
        features::MOOD_IMPROVEMENT,
    ] {
        if let Some(value) = observed.get(key) {
            factors.insert(key.to_string(), *value);
        }
    }
    factors.insert("progress_score".to_string(), progress);
    factors.extend(score.factors);

    Prediction {
        id: Uuid::new_v4(),
        patient_id,
        prediction_type: PredictionType::TreatmentProgress,
        summary: format!("Treatment progress: {}", band.label()),
        confidence: score.confidence.clamp(0.0, 1.0),
        factors,
        recommendation: band.recommendation().to_string(),
        risk_level: Some((100.0 - progress).trunc() as i32),
        risk_category: None,
        predicted_for: None,
        algorithm: score.algorithm,
        model_version: score.model_version,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn completed(total: usize, average_progress: Option<f64>, mood: f64) -> SessionFeatures {
        SessionFeatures {
            total_sessions: total,
            completed_sessions: total,
            cancellation_rate: 0.0,
            no_show_rate: 0.0,
            days_since_last_session: 7.0,
            avg_days_between_sessions: None,
            average_progress,
            mood_improvement: mood,
            avg_mood_after: None,
            last_progress_rating: None,
        }
    }

    #[test]
    fn base_score_without_history() {
        assert_eq!(local_progress_score(&completed(0, None, 0.0)), 50.0);
    }

    #[test]
    fn formula_adds_weighted_terms() {
        // 50 + 3*5 + 1.5*10 + min(4*2, 20)
        let score = local_progress_score(&completed(4, Some(3.0), 1.5));
        assert!((score - 88.0).abs() < 1e-9);
    }

    #[test]
    fn session_bonus_is_capped() {
        assert_eq!(local_progress_score(&completed(10, None, 0.0)), 70.0);
        assert_eq!(local_progress_score(&completed(60, None, 0.0)), 70.0);
    }

    #[test]
    fn score_is_clamped_both_ways() {
        assert_eq!(local_progress_score(&completed(100, Some(10.0), 10.0)), 100.0);
        assert_eq!(local_progress_score(&completed(0, Some(0.0), -9.0)), 0.0);
    }

    #[test]
    fn bands_follow_thresholds() {
        assert_eq!(ProgressBand::from_score(80.0), ProgressBand::Excellent);
        assert_eq!(ProgressBand::from_score(79.9), ProgressBand::Good);
        assert_eq!(ProgressBand::from_score(60.0), ProgressBand::Good);
        assert_eq!(ProgressBand::from_score(40.0), ProgressBand::Moderate);
        assert_eq!(ProgressBand::from_score(39.9), ProgressBand::NeedsAttention);
    }

    #[tokio::test]
    async fn local_branch_without_predictor() {
        let features = completed(4, Some(3.0), 1.5);
        let score = score_progress(&features, 0.8, None).await;
        assert_eq!(score.algorithm, LOCAL_ALGORITHM);
        assert_eq!(score.confidence, LOCAL_CONFIDENCE);

        let now = Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
        let prediction = progress_prediction(Uuid::nil(), &features, score, now);
        assert_eq!(prediction.summary, "Treatment progress: Excellent");
        assert_eq!(prediction.risk_level, Some(12));
        assert_eq!(prediction.risk_category, None);
        assert_eq!(prediction.factors["average_progress"], 3.0);
        assert_eq!(
            prediction.recommendation,
            ProgressBand::Excellent.recommendation()
        );
    }
}
