use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    /// Unknown availability or session.
    NotFound(Ulid),
    /// Requested length is neither 30 nor 60 minutes.
    InvalidDuration(i64),
    /// The mentor already has an active session at that time (id of the blocker).
    ConflictMentor(Ulid),
    /// The mentee already has an active session at that time (id of the blocker).
    ConflictMentee(Ulid),
    InvalidSpan { start: Ms, end: Ms },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            EngineError::ConflictMentor(_) | EngineError::ConflictMentee(_)
        )
    }

    /// Short snake_case name, used as a metrics label.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::ConflictMentor(_) => "conflict_mentor",
            EngineError::ConflictMentee(_) => "conflict_mentee",
            EngineError::InvalidSpan { .. } => "invalid_span",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::InvalidDuration(minutes) => write!(
                f,
                "invalid session length: {minutes} minutes (expected 30 or 60)"
            ),
            EngineError::ConflictMentor(_) => write!(
                f,
                "A session with this mentor is already scheduled during this time."
            ),
            EngineError::ConflictMentee(_) => write!(
                f,
                "A session with this mentee is already scheduled during this time."
            ),
            EngineError::InvalidSpan { start, end } => {
                write!(f, "invalid time window [{start}, {end}): end must be after start")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
