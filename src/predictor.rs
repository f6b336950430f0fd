//! Optional out-of-process scoring model, reached over HTTP.
//!
//! Every call returns a `Result`; callers treat any `Err` as "unavailable"
//! and switch to their local heuristic. Nothing here retries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Factors;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("predictor answered with status {0}")]
    Status(u16),
    #[error("malformed predictor response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DropoutRequest {
    pub cancellation_rate: f64,
    pub no_show_rate: f64,
    pub days_since_last_session: i64,
    pub total_sessions: usize,
    pub avg_mood_score: f64,
    pub age: i32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressRequest {
    pub total_sessions: usize,
    pub avg_progress_rating: f64,
    pub mood_improvement: f64,
    pub session_completion_rate: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NextSessionRequest {
    pub avg_days_between_sessions: f64,
    pub current_risk_level: i32,
    pub last_progress_rating: f64,
    pub patient_age: i32,
}

/// A score with its provenance. `score` is a 0-100 value for dropout and
/// progress, and a day count for next-session planning.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    pub score: f64,
    pub confidence: f64,
    pub factors: Factors,
    pub model_version: String,
    pub algorithm: String,
}

#[async_trait]
pub trait ExternalPredictor: Send + Sync {
    async fn dropout_risk(&self, request: &DropoutRequest) -> Result<ModelScore, PredictorError>;

    async fn treatment_progress(
        &self,
        request: &ProgressRequest,
    ) -> Result<ModelScore, PredictorError>;

    async fn next_session(
        &self,
        request: &NextSessionRequest,
    ) -> Result<ModelScore, PredictorError>;

    async fn health(&self) -> Result<(), PredictorError>;
}

#[derive(Debug, Deserialize)]
struct DropoutResponse {
    risk_score: f64,
    confidence: f64,
    #[serde(default)]
    factors: BTreeMap<String, f64>,
    model_version: Option<String>,
    algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProgressResponse {
    progress_score: f64,
    confidence: f64,
    model_version: Option<String>,
    algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NextSessionResponse {
    recommended_days: f64,
    confidence: f64,
    model_version: Option<String>,
    algorithm: Option<String>,
}

pub struct HttpPredictor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPredictor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PredictorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(HttpPredictor {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<R, PredictorError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PredictorError::Status(response.status().as_u16()));
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|err| PredictorError::Malformed(err.to_string()))
    }
}

#[async_trait]
impl ExternalPredictor for HttpPredictor {
    async fn dropout_risk(&self, request: &DropoutRequest) -> Result<ModelScore, PredictorError> {
        let response: DropoutResponse = self.post("/api/predict/dropout-risk", request).await?;
        validate_percent(response.risk_score, "risk_score")?;
        validate_confidence(response.confidence)?;

        Ok(ModelScore {
            score: response.risk_score,
            confidence: response.confidence,
            factors: response.factors,
            model_version: response.model_version.unwrap_or_else(|| "1.0.0".to_string()),
            algorithm: response.algorithm.unwrap_or_else(|| "RandomForest".to_string()),
        })
    }

    async fn treatment_progress(
        &self,
        request: &ProgressRequest,
    ) -> Result<ModelScore, PredictorError> {
        let response: ProgressResponse =
            self.post("/api/predict/treatment-progress", request).await?;
        validate_percent(response.progress_score, "progress_score")?;
        validate_confidence(response.confidence)?;

        Ok(ModelScore {
            score: response.progress_score,
            confidence: response.confidence,
            factors: Factors::new(),
            model_version: response.model_version.unwrap_or_else(|| "1.0.0".to_string()),
            algorithm: response.algorithm.unwrap_or_else(|| "GradientBoosting".to_string()),
        })
    }

    async fn next_session(
        &self,
        request: &NextSessionRequest,
    ) -> Result<ModelScore, PredictorError> {
        let response: NextSessionResponse =
            self.post("/api/predict/next-session", request).await?;
        if !response.recommended_days.is_finite() || response.recommended_days < 0.0 {
            return Err(PredictorError::Malformed(format!(
                "recommended_days {} is not a day count",
                response.recommended_days
            )));
        }
        validate_confidence(response.confidence)?;

        Ok(ModelScore {
            score: response.recommended_days,
            confidence: response.confidence,
            factors: Factors::new(),
            model_version: response.model_version.unwrap_or_else(|| "1.0.0".to_string()),
            algorithm: response.algorithm.unwrap_or_else(|| "LinearRegression".to_string()),
        })
    }

    async fn health(&self) -> Result<(), PredictorError> {
        let response = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PredictorError::Status(response.status().as_u16()))
        }
    }
}

/// Keeps a successful external score and logs a failed one. A failure
/// selects the caller's local heuristic for this call only.
pub fn accept(endpoint: &str, result: Result<ModelScore, PredictorError>) -> Option<ModelScore> {
    match result {
        Ok(score) => {
            info!(
                "{endpoint}: external score {:.2} (confidence {:.2}, {} {})",
                score.score, score.confidence, score.algorithm, score.model_version
            );
            Some(score)
        }
        Err(err) => {
            warn!("{endpoint}: external predictor unavailable, using local heuristic: {err}");
            None
        }
    }
}

fn validate_percent(value: f64, field: &str) -> Result<(), PredictorError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(PredictorError::Malformed(format!(
            "{field} {value} outside 0..=100"
        )))
    }
}

fn validate_confidence(value: f64) -> Result<(), PredictorError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PredictorError::Malformed(format!(
            "confidence {value} outside 0..=1"
        )))
    }
}
