use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Notice;
use crate::observability;

use super::conflict::{check_no_conflict, validate_instant, validate_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn publish_availability(
        &self,
        mentor_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Availability, EngineError> {
        let span = validate_window(start, end)?;
        let _gate = self.compaction_gate.read().await;

        let id = Ulid::new();
        let event = Event::AvailabilityPublished {
            id,
            mentor_id,
            span,
        };
        self.persist_record(&event).await?;
        debug!("mentor {mentor_id} published availability {id}");
        Ok(Availability {
            id,
            mentor_id,
            span,
        })
    }

    /// Book `duration_minutes` at `start` against a mentor's availability.
    ///
    /// The conflict check and the durable write happen under the mentor's and
    /// the mentee's calendar locks, so two racing requests for overlapping
    /// time cannot both succeed.
    pub async fn request_booking(
        &self,
        requester: Ulid,
        availability_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    ) -> Result<Session, EngineError> {
        let result = self
            .try_request_booking(requester, availability_id, start, duration_minutes)
            .await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.label(),
        };
        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_request_booking(
        &self,
        requester: Ulid,
        availability_id: Ulid,
        start: Ms,
        duration_minutes: i64,
    ) -> Result<Session, EngineError> {
        let availability = self
            .get_availability(availability_id)
            .ok_or(EngineError::NotFound(availability_id))?;
        let length = SessionLength::from_minutes(duration_minutes)
            .ok_or(EngineError::InvalidDuration(duration_minutes))?;
        validate_instant(start)?;
        validate_instant(start + length.as_ms())?;

        let _gate = self.compaction_gate.read().await;
        // Mentor first, then mentee. Every writer uses this order.
        let mut mentor = self
            .party(Role::Mentor, availability.mentor_id)
            .write_owned()
            .await;
        let mut mentee = self.party(Role::Mentee, requester).write_owned().await;
        let now = self.now_ms();
        for party in [&*mentor, &*mentee] {
            if party.live_count(now) >= self.policy.max_live_sessions {
                debug!("booking by {requester} refused: {} is at the session cap", party.id);
                return Err(EngineError::LimitExceeded("too many sessions for one party"));
            }
        }

        if let Err(e) = check_no_conflict(
            &mentor,
            &mentee,
            start,
            length,
            self.policy.conflict_rule,
            None,
        ) {
            debug!("booking by {requester} on {availability_id} rejected: {e}");
            return Err(e);
        }

        let session = Session {
            id: Ulid::new(),
            mentor_id: availability.mentor_id,
            mentee_id: requester,
            availability_id,
            start,
            length,
            status: self.policy.initial_status,
        };
        let event = Event::SessionRequested {
            id: session.id,
            mentor_id: session.mentor_id,
            mentee_id: session.mentee_id,
            availability_id,
            start,
            length,
            status: session.status,
        };
        self.persist_and_apply(&mut mentor, &mut mentee, &event)
            .await?;
        drop(mentee);
        drop(mentor);

        info!(
            "session {} booked: mentor {} mentee {} at {start} for {}m",
            session.id,
            session.mentor_id,
            session.mentee_id,
            length.minutes()
        );
        self.dispatch(Notice::SessionRequested {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Move a session to `status`. Setting the current status again is a no-op.
    ///
    /// Bringing a canceled session back re-checks both calendars first.
    pub async fn update_status(
        &self,
        session_id: Ulid,
        status: SessionStatus,
        actor: Ulid,
    ) -> Result<Session, EngineError> {
        let parties = self
            .get_session(session_id)
            .ok_or(EngineError::NotFound(session_id))?;

        let _gate = self.compaction_gate.read().await;
        let mut mentor = self
            .party(Role::Mentor, parties.mentor_id)
            .write_owned()
            .await;
        let mut mentee = self
            .party(Role::Mentee, parties.mentee_id)
            .write_owned()
            .await;

        // Re-read under the locks; a concurrent update may have landed.
        let current = self
            .get_session(session_id)
            .ok_or(EngineError::NotFound(session_id))?;
        if current.status == status {
            return Ok(current);
        }
        if status.is_active() && !current.status.is_active() {
            check_no_conflict(
                &mentor,
                &mentee,
                current.start,
                current.length,
                self.policy.conflict_rule,
                Some(session_id),
            )?;
        }

        let event = Event::SessionStatusChanged {
            id: session_id,
            status,
        };
        self.persist_and_apply(&mut mentor, &mut mentee, &event)
            .await?;
        drop(mentee);
        drop(mentor);

        metrics::counter!(observability::STATUS_CHANGES_TOTAL, "status" => status.as_str())
            .increment(1);
        info!(
            "session {session_id}: {} -> {status} by {actor}",
            current.status
        );

        let updated = Session { status, ..current };
        if status == SessionStatus::Canceled {
            self.dispatch(Notice::SessionCanceled {
                session: updated.clone(),
                canceled_by: actor,
            });
        }
        Ok(updated)
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    /// Sessions are emitted once, already carrying their current status.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut availabilities: Vec<Availability> = self
            .availabilities
            .iter()
            .map(|e| e.value().clone())
            .collect();
        availabilities.sort_by_key(|a| a.id);
        let mut sessions: Vec<Session> = self.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);

        let mut events = Vec::with_capacity(availabilities.len() + sessions.len());
        events.extend(availabilities.into_iter().map(|a| Event::AvailabilityPublished {
            id: a.id,
            mentor_id: a.mentor_id,
            span: a.span,
        }));
        events.extend(sessions.into_iter().map(|s| Event::SessionRequested {
            id: s.id,
            mentor_id: s.mentor_id,
            mentee_id: s.mentee_id,
            availability_id: s.availability_id,
            start: s.start,
            length: s.length,
            status: s.status,
        }));
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
