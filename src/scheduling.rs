//! Session lifecycle: booking, status changes, rescheduling, clinical notes.
//!
//! Conflicts are checked right before each write. Two bookings racing for
//! the same slot can both pass the check; nothing here locks across it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::conflict::{self, ConflictChecker};
use crate::error::{ClinicError, Result};
use crate::models::{SessionRecord, SessionStatus};
use crate::store::ClinicStore;

pub const MOOD_RANGE: std::ops::RangeInclusive<i32> = 0..=10;
pub const PROGRESS_RANGE: std::ops::RangeInclusive<i32> = 0..=10;

/// Mood and progress ratings share the 0..=10 scale wherever they enter
/// the system, notes and CSV import alike.
pub fn validate_ratings(
    mood_before: Option<i32>,
    mood_after: Option<i32>,
    progress_rating: Option<i32>,
) -> Result<()> {
    for (name, value, range) in [
        ("mood_before", mood_before, MOOD_RANGE),
        ("mood_after", mood_after, MOOD_RANGE),
        ("progress_rating", progress_rating, PROGRESS_RANGE),
    ] {
        if let Some(value) = value {
            if !range.contains(&value) {
                return Err(ClinicError::InvalidInput(format!(
                    "{name} {value} outside {}..={}",
                    range.start(),
                    range.end()
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub patient_id: Uuid,
    pub therapist_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub notes: Option<String>,
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct SessionNotes {
    pub therapist_notes: Option<String>,
    pub progress_rating: Option<i32>,
    pub mood_before: Option<i32>,
    pub mood_after: Option<i32>,
}

#[derive(Clone)]
pub struct SchedulingService {
    store: Arc<dyn ClinicStore>,
    conflicts: ConflictChecker,
    clock: Arc<dyn Clock>,
}

impl SchedulingService {
    pub fn new(store: Arc<dyn ClinicStore>, conflicts: ConflictChecker, clock: Arc<dyn Clock>) -> Self {
        SchedulingService {
            store,
            conflicts,
            clock,
        }
    }

    pub fn conflicts(&self) -> &ConflictChecker {
        &self.conflicts
    }

    pub async fn session(&self, session_id: Uuid) -> Result<SessionRecord> {
        self.store
            .session(session_id)
            .await?
            .ok_or_else(|| ClinicError::session_not_found(session_id))
    }

    pub async fn create_session(&self, request: NewSession) -> Result<SessionRecord> {
        if self.store.patient(request.patient_id).await?.is_none() {
            return Err(ClinicError::patient_not_found(request.patient_id));
        }
        if self.store.therapist(request.therapist_id).await?.is_none() {
            return Err(ClinicError::therapist_not_found(request.therapist_id));
        }
        conflict::validate_duration(request.duration_minutes)?;

        let clashes = self
            .conflicts
            .conflicting_sessions(
                request.therapist_id,
                request.scheduled_at,
                request.duration_minutes,
                None,
            )
            .await?;
        if !clashes.is_empty() {
            return Err(ClinicError::Conflict(
                "therapist has a conflicting appointment at this time".to_string(),
            ));
        }

        let mut session = SessionRecord::new(
            request.patient_id,
            request.therapist_id,
            request.scheduled_at,
            request.duration_minutes,
            self.clock.now(),
        );
        session.notes = request.notes;

        self.store.insert_session(&session).await?;
        info!(
            "session {} booked for patient {} with therapist {} at {}",
            session.id, session.patient_id, session.therapist_id, session.scheduled_at
        );
        Ok(session)
    }

    /// Plain status change. Stamps start, end or cancellation times as the
    /// target status requires.
    pub async fn transition(
        &self,
        session_id: Uuid,
        next: SessionStatus,
        reason: Option<String>,
    ) -> Result<SessionRecord> {
        let mut session = self.session(session_id).await?;
        if !session.status.can_transition_to(next) {
            return Err(ClinicError::InvalidTransition {
                from: session.status,
                to: next,
            });
        }

        let now = self.clock.now();
        match next {
            SessionStatus::InProgress => session.started_at = Some(now),
            SessionStatus::Completed => session.ended_at = Some(now),
            SessionStatus::Cancelled => {
                session.cancelled_at = Some(now);
                session.cancellation_reason = reason;
            }
            _ => {}
        }
        let previous = session.status;
        session.status = next;

        self.store.update_session(&session).await?;
        info!("session {session_id}: {previous} -> {next}");
        Ok(session)
    }

    pub async fn cancel(&self, session_id: Uuid, reason: &str) -> Result<SessionRecord> {
        self.transition(session_id, SessionStatus::Cancelled, Some(reason.to_string()))
            .await
    }

    /// Moves a live session, ignoring its own current slot when looking for
    /// conflicts, and re-arms its reminder.
    pub async fn reschedule(
        &self,
        session_id: Uuid,
        new_start: DateTime<Utc>,
    ) -> Result<SessionRecord> {
        let mut session = self.session(session_id).await?;
        if !session.status.can_reschedule() {
            return Err(ClinicError::InvalidTransition {
                from: session.status,
                to: SessionStatus::Rescheduled,
            });
        }

        let clashes = self
            .conflicts
            .conflicting_sessions(
                session.therapist_id,
                new_start,
                session.duration_minutes,
                Some(session.id),
            )
            .await?;
        if !clashes.is_empty() {
            return Err(ClinicError::Conflict(
                "therapist has a conflicting appointment at this time".to_string(),
            ));
        }

        let previous_start = session.scheduled_at;
        session.scheduled_at = new_start;
        session.status = SessionStatus::Rescheduled;
        session.reminder_sent = false;

        self.store.update_session(&session).await?;
        info!("session {session_id}: moved from {previous_start} to {new_start}");
        Ok(session)
    }

    /// Notes and ratings may be added at any point, completed sessions included.
    pub async fn add_notes(&self, session_id: Uuid, notes: SessionNotes) -> Result<SessionRecord> {
        validate_ratings(notes.mood_before, notes.mood_after, notes.progress_rating)?;

        let mut session = self.session(session_id).await?;
        if notes.therapist_notes.is_some() {
            session.therapist_notes = notes.therapist_notes;
        }
        if notes.progress_rating.is_some() {
            session.progress_rating = notes.progress_rating;
        }
        if notes.mood_before.is_some() {
            session.mood_before = notes.mood_before;
        }
        if notes.mood_after.is_some() {
            session.mood_after = notes.mood_after;
        }

        self.store.update_session(&session).await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::clock::FixedClock;
    use crate::conflict::ConflictPolicy;
    use crate::models::{Patient, Therapist};
    use crate::store::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 5, 8, 0, 0).unwrap()
    }

    fn slot(hours: i64) -> DateTime<Utc> {
        now() + Duration::days(1) + Duration::hours(hours)
    }

    struct Fixture {
        service: SchedulingService,
        patient: Uuid,
        therapist: Uuid,
    }

    fn fixture(policy: ConflictPolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let patient = Patient {
            id: Uuid::new_v4(),
            full_name: "Tomas Reyes".to_string(),
            email: "tomas@example.com".to_string(),
            date_of_birth: None,
            risk_score: None,
            risk_category: None,
            created_at: now(),
        };
        let therapist = Therapist {
            id: Uuid::new_v4(),
            full_name: "Dr. Anouk Vermeer".to_string(),
            email: "anouk@example.com".to_string(),
        };
        let (patient_id, therapist_id) = (patient.id, therapist.id);
        store.add_patient(patient);
        store.add_therapist(therapist);

        let checker = ConflictChecker::new(store.clone(), policy);
        Fixture {
            service: SchedulingService::new(store, checker, Arc::new(FixedClock(now()))),
            patient: patient_id,
            therapist: therapist_id,
        }
    }

    fn booking(fixture: &Fixture, at: DateTime<Utc>) -> NewSession {
        NewSession {
            patient_id: fixture.patient,
            therapist_id: fixture.therapist,
            scheduled_at: at,
            duration_minutes: 60,
            notes: None,
        }
    }

    #[tokio::test]
    async fn booking_starts_scheduled() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
        assert_eq!(session.status, SessionStatus::Scheduled);
        assert!(!session.reminder_sent);
        assert_eq!(session.created_at, now());
    }

    #[tokio::test]
    async fn double_booking_is_rejected() {
        let fx = fixture(ConflictPolicy::Overlap);
        fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
        let err = fx
            .service
            .create_session(booking(&fx, slot(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)));

        fx.service.create_session(booking(&fx, slot(2))).await.unwrap();
    }

    #[tokio::test]
    async fn booking_requires_known_parties() {
        let fx = fixture(ConflictPolicy::Overlap);
        let mut request = booking(&fx, slot(0));
        request.therapist_id = Uuid::new_v4();
        let err = fx.service.create_session(request).await.unwrap_err();
        assert!(matches!(err, ClinicError::NotFound { entity: "therapist", .. }));

        let mut request = booking(&fx, slot(0));
        request.patient_id = Uuid::new_v4();
        let err = fx.service.create_session(request).await.unwrap_err();
        assert!(matches!(err, ClinicError::NotFound { entity: "patient", .. }));
    }

    #[tokio::test]
    async fn full_lifecycle_stamps_times() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();

        let confirmed = fx
            .service
            .transition(session.id, SessionStatus::Confirmed, None)
            .await
            .unwrap();
        assert_eq!(confirmed.status, SessionStatus::Confirmed);

        let started = fx
            .service
            .transition(session.id, SessionStatus::InProgress, None)
            .await
            .unwrap();
        assert_eq!(started.started_at, Some(now()));

        let done = fx
            .service
            .transition(session.id, SessionStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.ended_at, Some(now()));

        let err = fx
            .service
            .transition(session.id, SessionStatus::Cancelled, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClinicError::InvalidTransition {
                from: SessionStatus::Completed,
                to: SessionStatus::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn cancelling_records_reason_and_frees_slot() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();

        let cancelled = fx.service.cancel(session.id, "patient unwell").await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(cancelled.cancelled_at, Some(now()));
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("patient unwell"));

        fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
    }

    #[tokio::test]
    async fn rescheduling_ignores_own_slot() {
        for policy in [ConflictPolicy::Overlap, ConflictPolicy::StartInWindow] {
            let fx = fixture(policy);
            let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();

            // The new window [-30min, +30min) holds the session's own start.
            let earlier = slot(0) - Duration::minutes(30);
            let moved = fx.service.reschedule(session.id, earlier).await.unwrap();
            assert_eq!(moved.status, SessionStatus::Rescheduled);
            assert_eq!(moved.scheduled_at, earlier);
            assert!(!moved.reminder_sent);

            let later = slot(0) + Duration::minutes(15);
            let moved_again = fx.service.reschedule(session.id, later).await.unwrap();
            assert_eq!(moved_again.scheduled_at, later);
        }
    }

    #[tokio::test]
    async fn rescheduling_onto_another_session_is_rejected() {
        for policy in [ConflictPolicy::Overlap, ConflictPolicy::StartInWindow] {
            let fx = fixture(policy);
            let first = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
            fx.service.create_session(booking(&fx, slot(3))).await.unwrap();

            let err = fx.service.reschedule(first.id, slot(3)).await.unwrap_err();
            assert!(matches!(err, ClinicError::Conflict(_)));
            let unchanged = fx.service.session(first.id).await.unwrap();
            assert_eq!(unchanged.scheduled_at, slot(0));
        }
    }

    #[tokio::test]
    async fn finished_sessions_cannot_move() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
        fx.service
            .transition(session.id, SessionStatus::NoShow, None)
            .await
            .unwrap();

        let err = fx.service.reschedule(session.id, slot(5)).await.unwrap_err();
        assert!(matches!(err, ClinicError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn notes_can_be_added_after_completion() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
        for status in [SessionStatus::InProgress, SessionStatus::Completed] {
            fx.service.transition(session.id, status, None).await.unwrap();
        }

        let noted = fx
            .service
            .add_notes(
                session.id,
                SessionNotes {
                    therapist_notes: Some("Worked on sleep hygiene".to_string()),
                    progress_rating: Some(4),
                    mood_before: Some(3),
                    mood_after: Some(6),
                },
            )
            .await
            .unwrap();
        assert_eq!(noted.status, SessionStatus::Completed);
        assert_eq!(noted.progress_rating, Some(4));

        let partial = fx
            .service
            .add_notes(
                session.id,
                SessionNotes {
                    mood_after: Some(7),
                    ..SessionNotes::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(partial.mood_after, Some(7));
        assert_eq!(partial.mood_before, Some(3));
        assert_eq!(partial.therapist_notes.as_deref(), Some("Worked on sleep hygiene"));
    }

    #[tokio::test]
    async fn out_of_range_ratings_are_rejected() {
        let fx = fixture(ConflictPolicy::Overlap);
        let session = fx.service.create_session(booking(&fx, slot(0))).await.unwrap();
        let err = fx
            .service
            .add_notes(
                session.id,
                SessionNotes {
                    mood_before: Some(11),
                    ..SessionNotes::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClinicError::InvalidInput(_)));
    }

    #[test]
    fn rating_bounds_are_inclusive() {
        assert!(validate_ratings(Some(0), Some(10), Some(10)).is_ok());
        assert!(validate_ratings(None, None, None).is_ok());
        assert!(validate_ratings(None, Some(-1), None).is_err());
        assert!(validate_ratings(None, None, Some(11)).is_err());
    }
}
