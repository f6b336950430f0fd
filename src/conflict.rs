use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::info;
use uuid::Uuid;

use crate::error::{ClinicError, Result};
use crate::models::SessionRecord;
use crate::store::ClinicStore;

/// Upper bound on a session's length. Also bounds how far back the overlap
/// lookup has to reach for sessions still running at the proposed start.
pub const MAX_SESSION_MINUTES: i32 = 8 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Existing and proposed intervals intersect.
    #[default]
    Overlap,
    /// An existing session starts inside `[start, end)` of the proposal.
    /// Sessions already running at the proposed start are not seen.
    StartInWindow,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Overlap => f.write_str("overlap"),
            ConflictPolicy::StartInWindow => f.write_str("start-in-window"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = ClinicError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "overlap" => Ok(ConflictPolicy::Overlap),
            "start-in-window" | "start_in_window" => Ok(ConflictPolicy::StartInWindow),
            other => Err(ClinicError::InvalidInput(format!(
                "unknown conflict policy '{other}'"
            ))),
        }
    }
}

pub fn validate_duration(duration_minutes: i32) -> Result<()> {
    if duration_minutes <= 0 || duration_minutes > MAX_SESSION_MINUTES {
        return Err(ClinicError::InvalidInput(format!(
            "session duration must be between 1 and {MAX_SESSION_MINUTES} minutes, got {duration_minutes}"
        )));
    }
    Ok(())
}

pub fn conflicts_with(
    policy: ConflictPolicy,
    existing: &SessionRecord,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> bool {
    if !existing.status.blocks_calendar() {
        return false;
    }

    match policy {
        ConflictPolicy::Overlap => existing.scheduled_at < end && existing.ends_at() > start,
        ConflictPolicy::StartInWindow => existing.scheduled_at >= start && existing.scheduled_at < end,
    }
}

#[derive(Clone)]
pub struct ConflictChecker {
    store: Arc<dyn ClinicStore>,
    policy: ConflictPolicy,
}

impl ConflictChecker {
    pub fn new(store: Arc<dyn ClinicStore>, policy: ConflictPolicy) -> Self {
        ConflictChecker { store, policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Sessions of the therapist that clash with the proposed slot, leaving
    /// out `exclude` (the session being moved, on reschedule).
    pub async fn conflicting_sessions(
        &self,
        therapist_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
        exclude: Option<Uuid>,
    ) -> Result<Vec<SessionRecord>> {
        validate_duration(duration_minutes)?;
        let end = start + Duration::minutes(i64::from(duration_minutes));
        let from = match self.policy {
            ConflictPolicy::Overlap => start - Duration::minutes(i64::from(MAX_SESSION_MINUTES)),
            ConflictPolicy::StartInWindow => start,
        };

        let candidates = self
            .store
            .therapist_sessions_starting_between(therapist_id, from, end)
            .await?;

        let conflicts: Vec<SessionRecord> = candidates
            .into_iter()
            .filter(|session| Some(session.id) != exclude)
            .filter(|session| conflicts_with(self.policy, session, start, end))
            .collect();

        if !conflicts.is_empty() {
            info!(
                "therapist {therapist_id}: {} session(s) clash with {start} (+{duration_minutes} min)",
                conflicts.len()
            );
        }
        Ok(conflicts)
    }

    pub async fn has_conflict(
        &self,
        therapist_id: Uuid,
        start: DateTime<Utc>,
        duration_minutes: i32,
    ) -> Result<bool> {
        let conflicts = self
            .conflicting_sessions(therapist_id, start, duration_minutes, None)
            .await?;
        Ok(!conflicts.is_empty())
    }
}
