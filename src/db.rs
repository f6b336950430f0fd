use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::conflict;
use crate::error::{ClinicError, Result};
use crate::models::{
    Factors, Patient, Prediction, RiskCategory, SessionRecord, SessionStatus, Therapist,
};
use crate::scheduling;
use crate::store::ClinicStore;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const SESSION_COLUMNS: &str = "id, patient_id, therapist_id, scheduled_at, duration_minutes, \
     status, mood_before, mood_after, progress_rating, notes, therapist_notes, started_at, \
     ended_at, cancelled_at, cancellation_reason, reminder_sent, created_at";

const PREDICTION_COLUMNS: &str = "id, patient_id, prediction_type, summary, confidence, factors, \
     recommendation, risk_level, risk_category, predicted_for, algorithm, model_version, created_at";

const PATIENT_COLUMNS: &str =
    "id, full_name, email, date_of_birth, risk_score, risk_category, created_at";

fn patient_from_row(row: &PgRow) -> Result<Patient> {
    let risk_category: Option<String> = row.try_get("risk_category")?;
    Ok(Patient {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        date_of_birth: row.try_get("date_of_birth")?,
        risk_score: row.try_get("risk_score")?,
        risk_category: risk_category.as_deref().map(str::parse).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<SessionRecord> {
    let status: String = row.try_get("status")?;
    Ok(SessionRecord {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        therapist_id: row.try_get("therapist_id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        duration_minutes: row.try_get("duration_minutes")?,
        status: status.parse()?,
        mood_before: row.try_get("mood_before")?,
        mood_after: row.try_get("mood_after")?,
        progress_rating: row.try_get("progress_rating")?,
        notes: row.try_get("notes")?,
        therapist_notes: row.try_get("therapist_notes")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        reminder_sent: row.try_get("reminder_sent")?,
        created_at: row.try_get("created_at")?,
    })
}

fn prediction_from_row(row: &PgRow) -> Result<Prediction> {
    let prediction_type: String = row.try_get("prediction_type")?;
    let risk_category: Option<String> = row.try_get("risk_category")?;
    let factors: Json<Factors> = row.try_get("factors")?;
    Ok(Prediction {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        prediction_type: prediction_type.parse()?,
        summary: row.try_get("summary")?,
        confidence: row.try_get("confidence")?,
        factors: factors.0,
        recommendation: row.try_get("recommendation")?,
        risk_level: row.try_get("risk_level")?,
        risk_category: risk_category.as_deref().map(str::parse).transpose()?,
        predicted_for: row.try_get("predicted_for")?,
        algorithm: row.try_get("algorithm")?,
        model_version: row.try_get("model_version")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ClinicStore for PgStore {
    async fn patient(&self, id: Uuid) -> Result<Option<Patient>> {
        let query = format!(
            "SELECT {PATIENT_COLUMNS} FROM clinic_early_warning.patients WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(patient_from_row).transpose()
    }

    async fn therapist(&self, id: Uuid) -> Result<Option<Therapist>> {
        let row = sqlx::query(
            "SELECT id, full_name, email FROM clinic_early_warning.therapists WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(Therapist {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                email: row.try_get("email")?,
            })),
            None => Ok(None),
        }
    }

    async fn session(&self, id: Uuid) -> Result<Option<SessionRecord>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM clinic_early_warning.sessions WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn patients(&self) -> Result<Vec<Patient>> {
        let query = format!(
            "SELECT {PATIENT_COLUMNS} FROM clinic_early_warning.patients ORDER BY full_name"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(patient_from_row).collect()
    }

    async fn patient_sessions(&self, patient_id: Uuid) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM clinic_early_warning.sessions \
             WHERE patient_id = $1 ORDER BY scheduled_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn therapist_sessions_starting_between(
        &self,
        therapist_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM clinic_early_warning.sessions \
             WHERE therapist_id = $1 AND scheduled_at >= $2 AND scheduled_at < $3 \
             ORDER BY scheduled_at ASC"
        );
        let rows = sqlx::query(&query)
            .bind(therapist_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clinic_early_warning.sessions
            (id, patient_id, therapist_id, scheduled_at, duration_minutes, status,
             mood_before, mood_after, progress_rating, notes, therapist_notes,
             started_at, ended_at, cancelled_at, cancellation_reason, reminder_sent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(session.id)
        .bind(session.patient_id)
        .bind(session.therapist_id)
        .bind(session.scheduled_at)
        .bind(session.duration_minutes)
        .bind(session.status.as_str())
        .bind(session.mood_before)
        .bind(session.mood_after)
        .bind(session.progress_rating)
        .bind(&session.notes)
        .bind(&session.therapist_notes)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.cancelled_at)
        .bind(&session.cancellation_reason)
        .bind(session.reminder_sent)
        .bind(session.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &SessionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE clinic_early_warning.sessions
            SET scheduled_at = $2, duration_minutes = $3, status = $4,
                mood_before = $5, mood_after = $6, progress_rating = $7,
                notes = $8, therapist_notes = $9, started_at = $10, ended_at = $11,
                cancelled_at = $12, cancellation_reason = $13, reminder_sent = $14
            WHERE id = $1
            "#,
        )
        .bind(session.id)
        .bind(session.scheduled_at)
        .bind(session.duration_minutes)
        .bind(session.status.as_str())
        .bind(session.mood_before)
        .bind(session.mood_after)
        .bind(session.progress_rating)
        .bind(&session.notes)
        .bind(&session.therapist_notes)
        .bind(session.started_at)
        .bind(session.ended_at)
        .bind(session.cancelled_at)
        .bind(&session.cancellation_reason)
        .bind(session.reminder_sent)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ClinicError::session_not_found(session.id));
        }
        Ok(())
    }

    async fn insert_prediction(&self, prediction: &Prediction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clinic_early_warning.predictions
            (id, patient_id, prediction_type, summary, confidence, factors, recommendation,
             risk_level, risk_category, predicted_for, algorithm, model_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(prediction.id)
        .bind(prediction.patient_id)
        .bind(prediction.prediction_type.as_str())
        .bind(&prediction.summary)
        .bind(prediction.confidence)
        .bind(Json(&prediction.factors))
        .bind(&prediction.recommendation)
        .bind(prediction.risk_level)
        .bind(prediction.risk_category.map(RiskCategory::as_str))
        .bind(prediction.predicted_for)
        .bind(&prediction.algorithm)
        .bind(&prediction.model_version)
        .bind(prediction.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_patient_risk(
        &self,
        patient_id: Uuid,
        risk_score: i32,
        risk_category: Option<RiskCategory>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE clinic_early_warning.patients
            SET risk_score = $2, risk_category = COALESCE($3, risk_category)
            WHERE id = $1
            "#,
        )
        .bind(patient_id)
        .bind(risk_score)
        .bind(risk_category.map(RiskCategory::as_str))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ClinicError::patient_not_found(patient_id));
        }
        Ok(())
    }

    async fn patient_predictions(
        &self,
        patient_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Prediction>> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM clinic_early_warning.predictions \
             WHERE patient_id = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(patient_id)
            .bind(limit.map(|limit| limit as i64))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }

    async fn high_risk_predictions(&self, min_risk: i32) -> Result<Vec<Prediction>> {
        let query = format!(
            "SELECT {PREDICTION_COLUMNS} FROM clinic_early_warning.predictions \
             WHERE risk_level >= $1 AND prediction_type IN ('DROPOUT_RISK', 'RISK_ASSESSMENT') \
             ORDER BY risk_level DESC, created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(min_risk)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(prediction_from_row).collect()
    }
}

async fn upsert_patient(
    pool: &PgPool,
    id: Uuid,
    full_name: &str,
    email: &str,
    date_of_birth: Option<NaiveDate>,
) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO clinic_early_warning.patients (id, full_name, email, date_of_birth)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET full_name = EXCLUDED.full_name,
            date_of_birth = COALESCE(EXCLUDED.date_of_birth, clinic_early_warning.patients.date_of_birth)
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(email)
    .bind(date_of_birth)
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(id)
}

async fn upsert_therapist(pool: &PgPool, id: Uuid, full_name: &str, email: &str) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO clinic_early_warning.therapists (id, full_name, email)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name
        RETURNING id
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(email)
    .fetch_one(pool)
    .await?
    .try_get("id")?;
    Ok(id)
}

struct HistoricSession<'a> {
    source_key: &'a str,
    patient_id: Uuid,
    therapist_id: Uuid,
    scheduled_at: DateTime<Utc>,
    duration_minutes: i32,
    status: SessionStatus,
    mood_before: Option<i32>,
    mood_after: Option<i32>,
    progress_rating: Option<i32>,
}

/// Returns whether a row was written; rows whose `source_key` is already
/// present are skipped.
async fn insert_historic_session(pool: &PgPool, session: &HistoricSession<'_>) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO clinic_early_warning.sessions
        (id, patient_id, therapist_id, scheduled_at, duration_minutes, status,
         mood_before, mood_after, progress_rating, source_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(session.patient_id)
    .bind(session.therapist_id)
    .bind(session.scheduled_at)
    .bind(session.duration_minutes)
    .bind(session.status.as_str())
    .bind(session.mood_before)
    .bind(session.mood_after)
    .bind(session.progress_rating)
    .bind(session.source_key)
    .bind(session.scheduled_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let therapist_id = upsert_therapist(
        pool,
        Uuid::parse_str("6a1f6c0e-5d3b-4f0a-9d41-2b8f0e7c1a55")?,
        "Dr. Maren Holt",
        "maren.holt@clinic.example",
    )
    .await?;

    let patients = vec![
        (
            Uuid::parse_str("b2f4c7d8-1e3a-4c59-8f0b-7a6d5e4c3b21")?,
            "Elias Varga",
            "elias.varga@example.com",
            NaiveDate::from_ymd_opt(1988, 4, 17).context("invalid date")?,
            "steady",
        ),
        (
            Uuid::parse_str("c9e8d7f6-2a1b-4e3c-9d8f-1a2b3c4d5e6f")?,
            "Priya Nandakumar",
            "priya.nandakumar@example.com",
            NaiveDate::from_ymd_opt(1996, 9, 2).context("invalid date")?,
            "slipping",
        ),
        (
            Uuid::parse_str("0f1e2d3c-4b5a-4968-8776-a5b4c3d2e1f0")?,
            "Jonah Whitfield",
            "jonah.whitfield@example.com",
            NaiveDate::from_ymd_opt(1979, 1, 23).context("invalid date")?,
            "disengaged",
        ),
    ];

    let now = Utc::now();
    for (id, name, email, date_of_birth, pattern) in patients {
        let patient_id = upsert_patient(pool, id, name, email, Some(date_of_birth)).await?;

        let history: Vec<(i64, SessionStatus)> = match pattern {
            "steady" => (1..=8)
                .map(|week| (week * 7, SessionStatus::Completed))
                .collect(),
            "slipping" => vec![
                (70, SessionStatus::Completed),
                (56, SessionStatus::Completed),
                (42, SessionStatus::Cancelled),
                (35, SessionStatus::Completed),
                (21, SessionStatus::NoShow),
                (14, SessionStatus::Cancelled),
            ],
            _ => vec![
                (120, SessionStatus::Completed),
                (105, SessionStatus::NoShow),
                (90, SessionStatus::Cancelled),
                (75, SessionStatus::NoShow),
                (60, SessionStatus::Cancelled),
            ],
        };

        for (index, (days_ago, status)) in history.into_iter().enumerate() {
            let source_key = format!("seed-{pattern}-{index:02}");
            let completed = status == SessionStatus::Completed;
            insert_historic_session(
                pool,
                &HistoricSession {
                    source_key: &source_key,
                    patient_id,
                    therapist_id,
                    scheduled_at: now - Duration::days(days_ago),
                    duration_minutes: 50,
                    status,
                    mood_before: completed.then_some(4),
                    mood_after: completed.then_some(6),
                    progress_rating: completed.then_some(3),
                },
            )
            .await?;
        }
    }

    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct CsvRow {
    patient_name: String,
    patient_email: String,
    date_of_birth: Option<NaiveDate>,
    therapist_name: String,
    therapist_email: String,
    scheduled_at: DateTime<Utc>,
    duration_minutes: i32,
    status: String,
    mood_before: Option<i32>,
    mood_after: Option<i32>,
    progress_rating: Option<i32>,
    source_key: Option<String>,
}

/// A CSV row that passed the same checks booking and notes apply.
#[derive(Debug)]
pub struct ImportRow {
    pub patient_name: String,
    pub patient_email: String,
    pub date_of_birth: Option<NaiveDate>,
    pub therapist_name: String,
    pub therapist_email: String,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: SessionStatus,
    pub mood_before: Option<i32>,
    pub mood_after: Option<i32>,
    pub progress_rating: Option<i32>,
    pub source_key: Option<String>,
}

/// Parses and validates every row before anything is written, so a bad
/// file imports nothing. Row numbers in errors count data rows from 1.
pub fn read_import_rows<R: std::io::Read>(input: R) -> anyhow::Result<Vec<ImportRow>> {
    let mut reader = csv::Reader::from_reader(input);
    let mut rows = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let line = index + 1;
        let row = result.with_context(|| format!("row {line}: unreadable"))?;
        let status: SessionStatus = row
            .status
            .parse()
            .with_context(|| format!("row {line}: bad status"))?;
        conflict::validate_duration(row.duration_minutes)
            .with_context(|| format!("row {line}: bad duration"))?;
        scheduling::validate_ratings(row.mood_before, row.mood_after, row.progress_rating)
            .with_context(|| format!("row {line}: bad rating"))?;

        rows.push(ImportRow {
            patient_name: row.patient_name,
            patient_email: row.patient_email,
            date_of_birth: row.date_of_birth,
            therapist_name: row.therapist_name,
            therapist_email: row.therapist_email,
            scheduled_at: row.scheduled_at,
            duration_minutes: row.duration_minutes,
            status,
            mood_before: row.mood_before,
            mood_after: row.mood_after,
            progress_rating: row.progress_rating,
            source_key: row.source_key,
        });
    }

    Ok(rows)
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let rows = read_import_rows(file)?;
    let mut inserted = 0usize;

    for row in rows {
        let patient_id = upsert_patient(
            pool,
            Uuid::new_v4(),
            &row.patient_name,
            &row.patient_email,
            row.date_of_birth,
        )
        .await?;
        let therapist_id =
            upsert_therapist(pool, Uuid::new_v4(), &row.therapist_name, &row.therapist_email)
                .await?;

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let written = insert_historic_session(
            pool,
            &HistoricSession {
                source_key: &source_key,
                patient_id,
                therapist_id,
                scheduled_at: row.scheduled_at,
                duration_minutes: row.duration_minutes,
                status: row.status,
                mood_before: row.mood_before,
                mood_after: row.mood_after,
                progress_rating: row.progress_rating,
            },
        )
        .await?;

        if written {
            inserted += 1;
        }
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "patient_name,patient_email,date_of_birth,therapist_name,therapist_email,\
scheduled_at,duration_minutes,status,mood_before,mood_after,progress_rating,source_key";

    fn csv_with(rows: &[&str]) -> String {
        let mut text = HEADER.to_string();
        for row in rows {
            text.push('\n');
            text.push_str(row);
        }
        text.push('\n');
        text
    }

    fn error_text(err: anyhow::Error) -> String {
        format!("{err:#}")
    }

    #[test]
    fn reads_valid_rows_with_partial_moods() {
        let text = csv_with(&[
            "Lena Ortiz,lena@example.com,1991-02-14,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-02T09:00:00Z,50,COMPLETED,,7,4,hist-001",
            "Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-09T09:00:00Z,50,no-show,,,,",
        ]);
        let rows = read_import_rows(text.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].mood_before, None);
        assert_eq!(rows[0].mood_after, Some(7));
        assert_eq!(rows[0].progress_rating, Some(4));
        assert_eq!(rows[0].source_key.as_deref(), Some("hist-001"));
        assert_eq!(rows[1].status, SessionStatus::NoShow);
        assert_eq!(rows[1].date_of_birth, None);
    }

    #[test]
    fn rejects_sessions_longer_than_the_conflict_lookback() {
        let text = csv_with(&[
            "Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-02T09:00:00Z,50,COMPLETED,,,,",
            "Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-03T01:00:00Z,600,COMPLETED,,,,",
        ]);
        let message = error_text(read_import_rows(text.as_bytes()).unwrap_err());
        assert!(message.contains("row 2: bad duration"), "{message}");
    }

    #[test]
    fn rejects_ratings_off_the_scale() {
        let mood = csv_with(&["Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-02T09:00:00Z,50,COMPLETED,12,6,,"]);
        let message = error_text(read_import_rows(mood.as_bytes()).unwrap_err());
        assert!(message.contains("row 1: bad rating"), "{message}");

        let progress = csv_with(&["Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-02T09:00:00Z,50,COMPLETED,4,6,-2,"]);
        assert!(read_import_rows(progress.as_bytes()).is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        let text = csv_with(&["Lena Ortiz,lena@example.com,,Dr. Ruth Amsel,ruth@clinic.example,\
2026-03-02T09:00:00Z,50,POSTPONED,,,,"]);
        let message = error_text(read_import_rows(text.as_bytes()).unwrap_err());
        assert!(message.contains("row 1: bad status"), "{message}");
    }
}
