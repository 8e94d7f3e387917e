use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC). The only time type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Bookable session lengths. Serialized as minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum SessionLength {
    Thirty,
    Sixty,
}

impl SessionLength {
    pub const LONGEST: SessionLength = SessionLength::Sixty;

    pub fn from_minutes(minutes: i64) -> Option<Self> {
        match minutes {
            30 => Some(SessionLength::Thirty),
            60 => Some(SessionLength::Sixty),
            _ => None,
        }
    }

    pub fn minutes(self) -> i64 {
        match self {
            SessionLength::Thirty => 30,
            SessionLength::Sixty => 60,
        }
    }

    pub fn as_ms(self) -> Ms {
        self.minutes() * MINUTE_MS
    }
}

impl From<SessionLength> for u16 {
    fn from(length: SessionLength) -> u16 {
        length.minutes() as u16
    }
}

impl TryFrom<u16> for SessionLength {
    type Error = String;

    fn try_from(minutes: u16) -> Result<Self, Self::Error> {
        SessionLength::from_minutes(minutes as i64)
            .ok_or_else(|| format!("unsupported session length: {minutes} minutes"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl SessionStatus {
    /// Active sessions occupy their time; canceled ones never block.
    pub fn is_active(self) -> bool {
        match self {
            SessionStatus::Pending | SessionStatus::Confirmed => true,
            SessionStatus::Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "Pending",
            SessionStatus::Confirmed => "Confirmed",
            SessionStatus::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(SessionStatus::Pending),
            "Confirmed" => Ok(SessionStatus::Confirmed),
            "Canceled" => Ok(SessionStatus::Canceled),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Which side of a session a calendar belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Mentor,
    Mentee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Mentor => f.write_str("mentor"),
            Role::Mentee => f.write_str("mentee"),
        }
    }
}

/// A mentor-published open window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub id: Ulid,
    pub mentor_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Ulid,
    pub mentor_id: Ulid,
    pub mentee_id: Ulid,
    pub availability_id: Ulid,
    pub start: Ms,
    pub length: SessionLength,
    pub status: SessionStatus,
}

impl Session {
    pub fn end(&self) -> Ms {
        self.start + self.length.as_ms()
    }

    /// Historical once the whole meeting lies behind `now`.
    pub fn is_past(&self, now: Ms) -> bool {
        self.end() <= now
    }

    pub fn involves(&self, user: Ulid) -> bool {
        self.mentor_id == user || self.mentee_id == user
    }

    /// Parties to tell about something `actor` did. Both, if the actor is neither.
    pub fn counterparts(&self, actor: Ulid) -> Vec<Ulid> {
        if actor == self.mentor_id && actor != self.mentee_id {
            vec![self.mentee_id]
        } else if actor == self.mentee_id && actor != self.mentor_id {
            vec![self.mentor_id]
        } else if actor == self.mentor_id {
            Vec::new()
        } else {
            vec![self.mentor_id, self.mentee_id]
        }
    }
}

/// One entry in a party's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub session_id: Ulid,
    pub start: Ms,
    pub length: SessionLength,
    pub status: SessionStatus,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.start + self.length.as_ms())
    }
}

/// Calendar of a single mentor or mentee.
#[derive(Debug, Clone)]
pub struct PartyState {
    pub id: Ulid,
    /// Every session the party is in, any status, sorted by `start`.
    pub slots: Vec<Slot>,
}

impl PartyState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by start.
    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self.slots.partition_point(|s| s.start <= slot.start);
        self.slots.insert(pos, slot);
    }

    pub fn slot_mut(&mut self, session_id: Ulid) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.session_id == session_id)
    }

    /// Slots whose span overlaps the query window, any status.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Slot> {
        // Everything at index >= right_bound starts at or after query.end.
        let right_bound = self.slots.partition_point(|s| s.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span().end > query.start)
    }

    /// Pending or confirmed sessions that have not ended by `now`.
    pub fn live_count(&self, now: Ms) -> usize {
        // Anything starting a full longest session before `now` is over.
        let first = self
            .slots
            .partition_point(|s| s.start + SessionLength::LONGEST.as_ms() <= now);
        self.slots[first..]
            .iter()
            .filter(|s| s.status.is_active() && s.span().end > now)
            .count()
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilityPublished {
        id: Ulid,
        mentor_id: Ulid,
        span: Span,
    },
    SessionRequested {
        id: Ulid,
        mentor_id: Ulid,
        mentee_id: Ulid,
        availability_id: Ulid,
        start: Ms,
        length: SessionLength,
        status: SessionStatus,
    },
    SessionStatusChanged {
        id: Ulid,
        status: SessionStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A party's sessions split at the archive horizon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionBuckets {
    pub upcoming: Vec<Session>,
    pub archived: Vec<Session>,
}
