mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{comparison_instants, ConflictRule, Probe};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::limits::MAX_LIVE_SESSIONS_PER_PARTY;
use crate::model::*;
use crate::notify::{Notice, Notifier};
use crate::observability;
use crate::wal::Wal;

pub type SharedPartyState = Arc<RwLock<PartyState>>;

/// Knobs that change scheduling outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub conflict_rule: ConflictRule,
    /// Status a freshly requested session starts in.
    pub initial_status: SessionStatus,
    /// Live sessions either party may hold before new bookings are refused.
    pub max_live_sessions: usize,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            conflict_rule: ConflictRule::default(),
            initial_status: SessionStatus::Pending,
            max_live_sessions: MAX_LIVE_SESSIONS_PER_PARTY,
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Keep ordering: the batch lands before the command runs.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    info!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!("WAL flush of {} events failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

/// All or nothing: a batch that fails leaves no trace in the log.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            wal.discard_pending();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            // Not produced by the loop; commit it on its own if it ever is.
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

/// The scheduler: availabilities, sessions and one calendar per party.
pub struct Engine {
    pub(super) mentors: DashMap<Ulid, SharedPartyState>,
    pub(super) mentees: DashMap<Ulid, SharedPartyState>,
    pub(super) availabilities: DashMap<Ulid, Availability>,
    pub(super) sessions: DashMap<Ulid, Session>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so its
    /// snapshot covers every appended event.
    pub(super) compaction_gate: RwLock<()>,
    notifier: Arc<dyn Notifier>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: SchedulerPolicy,
}

/// Apply an event to one calendar (caller holds the lock).
fn apply_to_party(ps: &mut PartyState, event: &Event) {
    match event {
        Event::SessionRequested {
            id,
            start,
            length,
            status,
            ..
        } => ps.insert_slot(Slot {
            session_id: *id,
            start: *start,
            length: *length,
            status: *status,
        }),
        Event::SessionStatusChanged { id, status } => {
            if let Some(slot) = ps.slot_mut(*id) {
                slot.status = *status;
            }
        }
        Event::AvailabilityPublished { .. } => {}
    }
}

/// Apply an event to the availability and session records.
fn apply_to_records(
    availabilities: &DashMap<Ulid, Availability>,
    sessions: &DashMap<Ulid, Session>,
    event: &Event,
) {
    match event {
        Event::AvailabilityPublished {
            id,
            mentor_id,
            span,
        } => {
            availabilities.insert(
                *id,
                Availability {
                    id: *id,
                    mentor_id: *mentor_id,
                    span: *span,
                },
            );
        }
        Event::SessionRequested {
            id,
            mentor_id,
            mentee_id,
            availability_id,
            start,
            length,
            status,
        } => {
            sessions.insert(
                *id,
                Session {
                    id: *id,
                    mentor_id: *mentor_id,
                    mentee_id: *mentee_id,
                    availability_id: *availability_id,
                    start: *start,
                    length: *length,
                    status: *status,
                },
            );
        }
        Event::SessionStatusChanged { id, status } => {
            if let Some(mut session) = sessions.get_mut(id) {
                session.status = *status;
            }
        }
    }
}

fn calendar_entry(calendars: &mut HashMap<Ulid, PartyState>, id: Ulid) -> &mut PartyState {
    calendars.entry(id).or_insert_with(|| PartyState::new(id))
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        policy: SchedulerPolicy,
    ) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let availabilities = DashMap::new();
        let sessions = DashMap::new();
        // Calendars are rebuilt unlocked, then wrapped once replay is done.
        let mut mentors = HashMap::new();
        let mut mentees = HashMap::new();

        for event in &events {
            apply_to_records(&availabilities, &sessions, event);
            let parties = match event {
                Event::SessionRequested {
                    mentor_id,
                    mentee_id,
                    ..
                } => Some((*mentor_id, *mentee_id)),
                Event::SessionStatusChanged { id, .. } => sessions
                    .get(id)
                    .map(|s| (s.mentor_id, s.mentee_id)),
                Event::AvailabilityPublished { .. } => None,
            };
            if let Some((mentor_id, mentee_id)) = parties {
                apply_to_party(calendar_entry(&mut mentors, mentor_id), event);
                apply_to_party(calendar_entry(&mut mentees, mentee_id), event);
            }
        }

        info!(
            "replayed {} events: {} availabilities, {} sessions",
            events.len(),
            availabilities.len(),
            sessions.len()
        );

        let wrap = |calendars: HashMap<Ulid, PartyState>| -> DashMap<Ulid, SharedPartyState> {
            calendars
                .into_iter()
                .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
                .collect()
        };

        Ok(Self {
            mentors: wrap(mentors),
            mentees: wrap(mentees),
            availabilities,
            sessions,
            wal_tx,
            compaction_gate: RwLock::new(()),
            notifier,
            clock,
            policy,
        })
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Calendar for `id` in `role`, created empty on first use.
    pub(super) fn party(&self, role: Role, id: Ulid) -> SharedPartyState {
        let calendars = match role {
            Role::Mentor => &self.mentors,
            Role::Mentee => &self.mentees,
        };
        calendars
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(PartyState::new(id))))
            .clone()
    }

    /// WAL-append, then apply to both calendars and the records.
    /// Callers hold the mentor and mentee write locks.
    pub(super) async fn persist_and_apply(
        &self,
        mentor: &mut PartyState,
        mentee: &mut PartyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_party(mentor, event);
        apply_to_party(mentee, event);
        apply_to_records(&self.availabilities, &self.sessions, event);
        Ok(())
    }

    pub(super) async fn persist_record(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_records(&self.availabilities, &self.sessions, event);
        Ok(())
    }

    /// Hand a notice to the notifier without waiting for it.
    pub(super) fn dispatch(&self, notice: Notice) {
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let session_id = notice.session().id;
            let result = match &notice {
                Notice::SessionRequested { session } => {
                    notifier.mentor_session_requested(session).await
                }
                Notice::SessionCanceled {
                    session,
                    canceled_by,
                } => notifier.session_canceled(session, *canceled_by).await,
            };
            if let Err(e) = result {
                warn!("{} notification for session {session_id} failed: {e}", notice.kind());
                metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL, "kind" => notice.kind())
                    .increment(1);
            }
        });
    }
}
