use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::notify::{Notice, NotifyHub};
use crate::observability::NOTIFICATION_STREAMS_ACTIVE;

use super::{AppState, CurrentUser, SessionView};

/// SSE payload. `canceled_by` is present on cancellations only.
#[derive(Debug, Serialize)]
struct NoticeView {
    kind: &'static str,
    session: SessionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    canceled_by: Option<Ulid>,
}

/// One open stream. However the client goes away, dropping this releases
/// the hub channel and keeps the open-streams gauge honest.
struct Subscription {
    rx: Option<broadcast::Receiver<Notice>>,
    user: Ulid,
    hub: Arc<NotifyHub>,
}

impl Subscription {
    fn open(hub: Arc<NotifyHub>, user: Ulid) -> Self {
        metrics::gauge!(NOTIFICATION_STREAMS_ACTIVE).increment(1.0);
        Self {
            rx: Some(hub.subscribe(user)),
            user,
            hub,
        }
    }

    async fn recv(&mut self) -> Result<Notice, RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        metrics::gauge!(NOTIFICATION_STREAMS_ACTIVE).decrement(1.0);
        if let Some(rx) = self.rx.take() {
            self.hub.unsubscribe(self.user, rx);
        }
        debug!("notification stream closed for {}", self.user);
    }
}

/// Server-sent events carrying every notice addressed to the caller.
pub async fn stream(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = Subscription::open(state.hub.clone(), user.id);
    debug!("notification stream opened for {}", user.id);

    let events = stream::unfold(
        (subscription, state),
        |(mut subscription, state)| async move {
            loop {
                let notice = match subscription.recv().await {
                    Ok(notice) => notice,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("notification stream lagging, {missed} notices dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                };
                let view = NoticeView {
                    kind: notice.kind(),
                    session: SessionView::new(notice.session(), state.engine.now_ms()),
                    canceled_by: match &notice {
                        Notice::SessionCanceled { canceled_by, .. } => Some(*canceled_by),
                        Notice::SessionRequested { .. } => None,
                    },
                };
                match SseEvent::default().event(view.kind).json_data(&view) {
                    Ok(event) => return Some((Ok(event), (subscription, state))),
                    Err(e) => warn!("dropping unserializable notice: {e}"),
                }
            }
        },
    );

    Sse::new(events).keep_alive(KeepAlive::default())
}
