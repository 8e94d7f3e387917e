use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::Engine;

impl Engine {
    pub fn get_availability(&self, id: Ulid) -> Option<Availability> {
        self.availabilities.get(&id).map(|e| e.value().clone())
    }

    pub fn get_session(&self, id: Ulid) -> Option<Session> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn availability_count(&self) -> usize {
        self.availabilities.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every session `user` takes part in, as mentor or as mentee, split at
    /// `now - horizon_ms`. Both buckets are ordered by start time.
    pub async fn sessions_for(&self, user: Ulid, horizon_ms: Ms) -> SessionBuckets {
        let mut ids = Vec::new();
        for calendars in [&self.mentors, &self.mentees] {
            let Some(party) = calendars.get(&user).map(|e| e.value().clone()) else {
                continue;
            };
            let guard = party.read().await;
            ids.extend(guard.slots.iter().map(|s| s.session_id));
        }

        // A user who booked themselves appears in both calendars.
        let mut seen = HashSet::with_capacity(ids.len());
        let mut sessions: Vec<Session> = ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.get_session(id))
            .collect();
        sessions.sort_by_key(|s| (s.start, s.id));

        let cutoff = self.now_ms() - horizon_ms;
        let (upcoming, archived) = sessions.into_iter().partition(|s| s.start >= cutoff);
        SessionBuckets { upcoming, archived }
    }
}
