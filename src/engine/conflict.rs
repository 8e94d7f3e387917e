use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// How a requested slot is matched against a party's existing sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictRule {
    /// Fixed ±30 minute probe table, exact on a 30-minute grid only.
    SlotTable,
    /// Half-open interval overlap.
    #[default]
    Interval,
}

impl ConflictRule {
    pub fn conflicts(self, start: Ms, length: SessionLength, existing: &Slot) -> bool {
        match self {
            ConflictRule::SlotTable => comparison_instants(start, length)
                .iter()
                .any(|probe| probe.matches(existing)),
            ConflictRule::Interval => {
                Span::new(start, start + length.as_ms()).overlaps(&existing.span())
            }
        }
    }
}

impl fmt::Display for ConflictRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictRule::SlotTable => f.write_str("slot-table"),
            ConflictRule::Interval => f.write_str("interval"),
        }
    }
}

impl FromStr for ConflictRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "slot-table" | "slot_table" => Ok(ConflictRule::SlotTable),
            "interval" => Ok(ConflictRule::Interval),
            other => Err(format!("unknown conflict rule: {other}")),
        }
    }
}

/// An instant at which an existing session start counts as a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub at: Ms,
    /// `Some` restricts the match to existing sessions of that length.
    pub only: Option<SessionLength>,
}

impl Probe {
    fn matches(&self, existing: &Slot) -> bool {
        existing.start == self.at && self.only.is_none_or(|len| len == existing.length)
    }
}

/// Probe instants for a request starting at `start`.
///
/// 30 minutes: `start` (any length), `start - 30m` (60-minute sessions).
/// 60 minutes: additionally `start + 30m` (any length).
pub fn comparison_instants(start: Ms, length: SessionLength) -> Vec<Probe> {
    let half_hour = SessionLength::Thirty.as_ms();
    let mut probes = vec![
        Probe { at: start, only: None },
        Probe {
            at: start - half_hour,
            only: Some(SessionLength::Sixty),
        },
    ];
    if length == SessionLength::Sixty {
        probes.push(Probe {
            at: start + half_hour,
            only: None,
        });
    }
    probes
}

/// First active session in `party` that collides with the request.
///
/// `ignore` skips one session (used when reactivating it).
pub(crate) fn find_conflict(
    party: &PartyState,
    start: Ms,
    length: SessionLength,
    rule: ConflictRule,
    ignore: Option<Ulid>,
) -> Option<Ulid> {
    // Wide enough for both rules: a 60-minute session starting up to an hour
    // before, through anything starting before the request ends.
    let window = Span::new(start - SessionLength::LONGEST.as_ms(), start + length.as_ms());
    party
        .overlapping(&window)
        .filter(|slot| slot.status.is_active() && Some(slot.session_id) != ignore)
        .find(|slot| rule.conflicts(start, length, slot))
        .map(|slot| slot.session_id)
}

/// Mentor is checked before mentee; the first hit decides the error.
pub(crate) fn check_no_conflict(
    mentor: &PartyState,
    mentee: &PartyState,
    start: Ms,
    length: SessionLength,
    rule: ConflictRule,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(blocker) = find_conflict(mentor, start, length, rule, ignore) {
        return Err(EngineError::ConflictMentor(blocker));
    }
    if let Some(blocker) = find_conflict(mentee, start, length, rule, ignore) {
        return Err(EngineError::ConflictMentee(blocker));
    }
    Ok(())
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    use crate::limits::*;
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidSpan { start, end });
    }
    validate_instant(start)?;
    validate_instant(end)?;
    if end - start > crate::limits::MAX_AVAILABILITY_SPAN_MS {
        return Err(EngineError::LimitExceeded("availability window too wide"));
    }
    Ok(Span::new(start, end))
}
