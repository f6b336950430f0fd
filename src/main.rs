use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use log::info;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use clinic_early_warning::clock::{Clock, SystemClock};
use clinic_early_warning::config::AppConfig;
use clinic_early_warning::conflict::{ConflictChecker, ConflictPolicy};
use clinic_early_warning::db::{self, PgStore};
use clinic_early_warning::models::{Prediction, SessionRecord, SessionStatus};
use clinic_early_warning::predictor::{ExternalPredictor, HttpPredictor};
use clinic_early_warning::scheduling::{NewSession, SchedulingService, SessionNotes};
use clinic_early_warning::service::{self, ScoringService};
use clinic_early_warning::store::ClinicStore;
use clinic_early_warning::{report, risk};

#[derive(Parser)]
#[command(name = "clinic-early-warning")]
#[command(about = "Dropout risk, progress scoring and session scheduling for a therapy practice", long_about = None)]
struct Cli {
    /// Base URL of the external scoring service, overriding ML_SERVICE_URL
    #[arg(long, global = true)]
    ml_url: Option<String>,
    /// Score with the local heuristics only
    #[arg(long, global = true)]
    no_ml: bool,
    /// `overlap` or `start-in-window`, overriding CONFLICT_POLICY
    #[arg(long, global = true)]
    conflict_policy: Option<ConflictPolicy>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum PredictionKind {
    Dropout,
    Progress,
    NextSession,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo clinic data
    Seed,
    /// Import session history from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Score a patient and record the prediction
    Predict {
        #[arg(value_enum)]
        kind: PredictionKind,
        #[arg(long)]
        patient: Uuid,
    },
    /// List a patient's predictions, newest first
    Predictions {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List dropout predictions at or above a risk level
    HighRisk {
        #[arg(long, default_value_t = risk::HIGH_THRESHOLD as i32)]
        min_risk: i32,
    },
    /// Check whether a therapist is free for a slot
    CheckConflict {
        #[arg(long)]
        therapist: Uuid,
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long, default_value_t = 60)]
        duration: i32,
    },
    /// Book a new session
    Schedule {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        therapist: Uuid,
        #[arg(long)]
        at: DateTime<Utc>,
        #[arg(long, default_value_t = 60)]
        duration: i32,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Move a session to a new start time
    Reschedule {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Change a session's status
    Status {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        to: SessionStatus,
    },
    /// Cancel a session
    Cancel {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        reason: String,
    },
    /// Record clinical notes and ratings for a session
    #[command(group(
        ArgGroup::new("fields")
            .args(["therapist_notes", "progress", "mood_before", "mood_after"])
            .required(true)
            .multiple(true)
    ))]
    Notes {
        #[arg(long)]
        session: Uuid,
        #[arg(long)]
        therapist_notes: Option<String>,
        #[arg(long)]
        progress: Option<i32>,
        #[arg(long)]
        mood_before: Option<i32>,
        #[arg(long)]
        mood_after: Option<i32>,
    },
    /// Check the external scoring service
    MlHealth,
    /// Generate a markdown report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn print_prediction(prediction: &Prediction) {
    println!("{} ({})", prediction.summary, prediction.prediction_type);
    if let Some(risk_level) = prediction.risk_level {
        match prediction.risk_category {
            Some(category) => println!("  risk level {risk_level} [{category}]"),
            None => println!("  risk level {risk_level}"),
        }
    }
    if let Some(predicted_for) = prediction.predicted_for {
        println!("  next session by {}", predicted_for.format("%Y-%m-%d"));
    }
    println!(
        "  confidence {:.2} via {} {}",
        prediction.confidence, prediction.algorithm, prediction.model_version
    );
    for (name, value) in prediction.factors.iter() {
        println!("  - {name}: {value:.2}");
    }
    println!("  therapist: {}", prediction.recommendation);
    println!("  patient: {}", service::patient_message(prediction));
}

fn print_session(session: &SessionRecord) {
    println!(
        "Session {} at {} ({} min) is {}.",
        session.id,
        session.scheduled_at.format("%Y-%m-%d %H:%M UTC"),
        session.duration_minutes,
        session.status
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let predictor: Option<Arc<dyn ExternalPredictor>> = match cli.ml_url.or(config.ml_service_url) {
        Some(url) if !cli.no_ml => {
            let predictor = HttpPredictor::new(&url, config.ml_timeout)
                .context("failed to build the scoring service client")?;
            info!("external scoring service at {url}");
            Some(Arc::new(predictor) as Arc<dyn ExternalPredictor>)
        }
        _ => None,
    };

    let store: Arc<dyn ClinicStore> = Arc::new(PgStore::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let policy = cli.conflict_policy.unwrap_or(config.conflict_policy);
    let scoring = ScoringService::new(store.clone(), predictor, clock.clone());
    let scheduling = SchedulingService::new(
        store.clone(),
        ConflictChecker::new(store.clone(), policy),
        clock.clone(),
    );

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} sessions from {}.", csv.display());
        }
        Commands::Predict { kind, patient } => {
            let prediction = match kind {
                PredictionKind::Dropout => scoring.dropout_risk(patient).await?,
                PredictionKind::Progress => scoring.treatment_progress(patient).await?,
                PredictionKind::NextSession => scoring.next_session(patient).await?,
            };
            print_prediction(&prediction);
        }
        Commands::Predictions { patient, limit } => {
            let predictions = scoring.patient_predictions(patient, limit).await?;
            if predictions.is_empty() {
                println!("No predictions recorded for this patient.");
                return Ok(());
            }
            for prediction in predictions.iter() {
                println!(
                    "- {} {}: {} (confidence {:.2}, {})",
                    prediction.created_at.format("%Y-%m-%d %H:%M"),
                    prediction.prediction_type,
                    prediction.summary,
                    prediction.confidence,
                    prediction.algorithm
                );
            }
        }
        Commands::HighRisk { min_risk } => {
            let predictions = scoring.high_risk_predictions(min_risk).await?;
            if predictions.is_empty() {
                println!("No predictions at or above risk {min_risk}.");
                return Ok(());
            }

            println!("Predictions at or above risk {min_risk}:");
            for prediction in predictions.iter() {
                let name = match store.patient(prediction.patient_id).await? {
                    Some(patient) => patient.full_name,
                    None => prediction.patient_id.to_string(),
                };
                println!(
                    "- {} risk {} on {}: {}",
                    name,
                    prediction.risk_level.unwrap_or(0),
                    prediction.created_at.format("%Y-%m-%d"),
                    prediction.recommendation
                );
            }
        }
        Commands::CheckConflict {
            therapist,
            at,
            duration,
        } => {
            let clashes = scheduling
                .conflicts()
                .conflicting_sessions(therapist, at, duration, None)
                .await?;
            if clashes.is_empty() {
                println!("Therapist is free at {at} ({policy} policy).");
            } else {
                println!("Therapist has {} conflicting session(s):", clashes.len());
                for session in clashes.iter() {
                    print_session(session);
                }
            }
        }
        Commands::Schedule {
            patient,
            therapist,
            at,
            duration,
            notes,
        } => {
            let session = scheduling
                .create_session(NewSession {
                    patient_id: patient,
                    therapist_id: therapist,
                    scheduled_at: at,
                    duration_minutes: duration,
                    notes,
                })
                .await?;
            print_session(&session);
        }
        Commands::Reschedule { session, at } => {
            let session = scheduling.reschedule(session, at).await?;
            print_session(&session);
        }
        Commands::Status { session, to } => {
            let session = scheduling.transition(session, to, None).await?;
            print_session(&session);
        }
        Commands::Cancel { session, reason } => {
            let session = scheduling.cancel(session, &reason).await?;
            print_session(&session);
        }
        Commands::Notes {
            session,
            therapist_notes,
            progress,
            mood_before,
            mood_after,
        } => {
            let session = scheduling
                .add_notes(
                    session,
                    SessionNotes {
                        therapist_notes,
                        progress_rating: progress,
                        mood_before,
                        mood_after,
                    },
                )
                .await?;
            print_session(&session);
        }
        Commands::MlHealth => match scoring.predictor_health().await {
            None => println!("No external scoring service configured; using local heuristics."),
            Some(Ok(())) => println!("External scoring service is healthy."),
            Some(Err(err)) => println!("External scoring service unavailable: {err}"),
        },
        Commands::Report { out } => {
            let patients = store.patients().await?;
            let high_risk = scoring
                .high_risk_predictions(risk::HIGH_THRESHOLD as i32)
                .await?;
            let report = report::build_report(&patients, &high_risk, clock.now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
