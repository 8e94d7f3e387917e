use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Session;

const CHANNEL_CAPACITY: usize = 256;

/// Something a user should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    SessionRequested { session: Session },
    SessionCanceled { session: Session, canceled_by: Ulid },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::SessionRequested { .. } => "session_requested",
            Notice::SessionCanceled { .. } => "session_canceled",
        }
    }

    pub fn session(&self) -> &Session {
        match self {
            Notice::SessionRequested { session } | Notice::SessionCanceled { session, .. } => {
                session
            }
        }
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Delivery(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Delivery(e) => write!(f, "notification delivery failed: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound notification capability used by the scheduler.
///
/// Calls are fire-and-forget from the scheduler's point of view: an error is
/// logged and counted, never propagated to the booking.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A mentee asked for a session; tell the mentor.
    async fn mentor_session_requested(&self, session: &Session) -> Result<(), NotifyError>;

    /// `actor` canceled the session; tell the other party.
    async fn session_canceled(&self, session: &Session, actor: Ulid) -> Result<(), NotifyError>;
}

/// Per-user broadcast hub. Backs the `/notifications` stream.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notices addressed to `user`. Creates the channel if needed.
    pub fn subscribe(&self, user: Ulid) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(user)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver to every live subscriber of `user`. Returns how many received it.
    pub fn send(&self, user: Ulid, notice: &Notice) -> usize {
        let Some(sender) = self.channels.get(&user) else {
            return 0;
        };
        match sender.send(notice.clone()) {
            Ok(n) => n,
            Err(_) => {
                drop(sender);
                // Last subscriber went away; drop the channel.
                self.channels
                    .remove_if(&user, |_, tx| tx.receiver_count() == 0);
                0
            }
        }
    }

    /// Drop `rx` and forget the user's channel once nobody is listening.
    pub fn unsubscribe(&self, user: Ulid, rx: broadcast::Receiver<Notice>) {
        drop(rx);
        self.channels
            .remove_if(&user, |_, tx| tx.receiver_count() == 0);
    }

    pub fn subscriber_count(&self, user: Ulid) -> usize {
        self.channels
            .get(&user)
            .map_or(0, |tx| tx.receiver_count())
    }
}

#[async_trait]
impl Notifier for NotifyHub {
    async fn mentor_session_requested(&self, session: &Session) -> Result<(), NotifyError> {
        let notice = Notice::SessionRequested {
            session: session.clone(),
        };
        self.send(session.mentor_id, &notice);
        Ok(())
    }

    async fn session_canceled(&self, session: &Session, actor: Ulid) -> Result<(), NotifyError> {
        let notice = Notice::SessionCanceled {
            session: session.clone(),
            canceled_by: actor,
        };
        for recipient in session.counterparts(actor) {
            self.send(recipient, &notice);
        }
        Ok(())
    }
}
