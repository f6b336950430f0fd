use thiserror::Error;
use uuid::Uuid;

use crate::models::SessionStatus;

pub type Result<T> = std::result::Result<T, ClinicError>;

#[derive(Debug, Error)]
pub enum ClinicError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("scheduling conflict: {0}")]
    Conflict(String),
    #[error("session cannot move from {from} to {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl ClinicError {
    pub fn patient_not_found(id: Uuid) -> Self {
        ClinicError::NotFound {
            entity: "patient",
            id,
        }
    }

    pub fn therapist_not_found(id: Uuid) -> Self {
        ClinicError::NotFound {
            entity: "therapist",
            id,
        }
    }

    pub fn session_not_found(id: Uuid) -> Self {
        ClinicError::NotFound {
            entity: "session",
            id,
        }
    }
}
