//! Session lifecycle: the state machine that ties commands, the event stream
//! and durable storage together for one generation request at a time.

use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::{HistoryEntry, RequestId, SessionStatus, StreamState},
    protocol::AgentUpdate,
};
use storage::{ActiveSessionRecord, SessionStore, SqliteKeyValueStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::{
    command_client::{CommandClient, HttpCommandClient},
    config::{prepare_database_url, ClientSettings},
    error::SessionError,
    stream::{SseStreamConsumer, StreamConsumer, StreamHandle},
};

/// In-memory view of the current session, owned by [`SessionController`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub request_id: Option<RequestId>,
    pub intent: String,
    pub draft_text: String,
    pub updates: Vec<AgentUpdate>,
    pub status: SessionStatus,
    pub stream_state: StreamState,
}

impl Session {
    fn snapshot(&self, request_id: RequestId) -> ActiveSessionRecord {
        ActiveSessionRecord {
            request_id,
            intent: self.intent.clone(),
            draft: self.draft_text.clone(),
            updates: self.updates.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalOutcome {
    pub request_id: RequestId,
    pub status: SessionStatus,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    UpdateApplied {
        request_id: RequestId,
        update: AgentUpdate,
    },
    Archived(HistoryEntry),
    /// Delivery stopped before the run finalized.
    StreamEnded {
        request_id: RequestId,
    },
}

struct Subscription {
    handle: StreamHandle,
    updates: mpsc::UnboundedReceiver<AgentUpdate>,
}

pub struct SessionController {
    commands: Arc<dyn CommandClient>,
    streams: Arc<dyn StreamConsumer>,
    store: SessionStore,
    session: Session,
    subscription: Option<Subscription>,
    /// Set by `resume`: the reopened stream replays the run, so its first
    /// event replaces the restored updates.
    replay_pending: bool,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        commands: Arc<dyn CommandClient>,
        streams: Arc<dyn StreamConsumer>,
        store: SessionStore,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            commands,
            streams,
            store,
            session: Session::default(),
            subscription: None,
            replay_pending: false,
            events,
        }
    }

    /// Wires the HTTP command client, SSE consumer and sqlite store from settings.
    pub async fn connect(settings: &ClientSettings) -> anyhow::Result<Self> {
        let database_url = prepare_database_url(&settings.database_url)?;
        let kv = SqliteKeyValueStore::new(&database_url).await?;
        let store = SessionStore::with_namespace(Arc::new(kv), settings.storage_namespace.clone());
        Ok(Self::new(
            Arc::new(HttpCommandClient::from_settings(settings)?),
            Arc::new(SseStreamConsumer::from_settings(settings)?),
            store,
        ))
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn has_live_stream(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn history(&self) -> Result<Vec<HistoryEntry>, SessionError> {
        Ok(self.store.load_history().await?)
    }

    pub async fn start(&mut self, intent: &str) -> Result<RequestId, SessionError> {
        self.recover_abandoned_start();
        if intent.trim().is_empty() {
            return Err(SessionError::Validation(
                "intent must not be empty".to_string(),
            ));
        }
        if self.session.status != SessionStatus::Idle {
            return Err(SessionError::Validation(format!(
                "a session is already active ({})",
                self.session.status
            )));
        }

        self.transition(SessionStatus::Starting);
        let request_id = match self.commands.start(intent).await {
            Ok(request_id) => request_id,
            Err(err) => {
                warn!(error = %err, "session: start command failed");
                self.transition(SessionStatus::Idle);
                return Err(err);
            }
        };

        let next = Session {
            request_id: Some(request_id),
            intent: intent.to_string(),
            ..Session::default()
        };
        if let Err(err) = self.store.save_active(&next.snapshot(request_id)).await {
            self.transition(SessionStatus::Idle);
            return Err(err.into());
        }

        self.session.request_id = next.request_id;
        self.session.intent = next.intent;
        self.session.draft_text.clear();
        self.session.updates.clear();
        self.replay_pending = false;
        self.open_subscription(request_id);
        self.transition(SessionStatus::Streaming);
        info!(request_id = request_id.0, "session: generation started");
        Ok(request_id)
    }

    /// Waits for the next event of the current run.
    ///
    /// Returns `None` when there is no live subscription or the stream ended;
    /// in the latter case the session keeps its status and is marked
    /// [`StreamState::Ended`].
    pub async fn next_update(&mut self) -> Option<AgentUpdate> {
        let subscription = self.subscription.as_mut()?;
        if let Some(update) = subscription.updates.recv().await {
            return Some(update);
        }

        let request_id = subscription.handle.request_id();
        self.abandon_stream(request_id);
        None
    }

    /// Applies events until the run finalizes or the stream ends.
    pub async fn drive(&mut self) -> Result<SessionStatus, SessionError> {
        while let Some(update) = self.next_update().await {
            self.on_update(update).await?;
            if self.session.status == SessionStatus::AwaitingReview {
                break;
            }
        }
        Ok(self.session.status)
    }

    pub async fn on_update(&mut self, update: AgentUpdate) -> Result<(), SessionError> {
        let request_id = self.active_request_id()?;
        if !self.session.status.expects_stream() {
            return Err(SessionError::Precondition(format!(
                "cannot apply a stream update while {}",
                self.session.status
            )));
        }

        let mut updates = if self.replay_pending {
            Vec::new()
        } else {
            self.session.updates.clone()
        };
        updates.push(update.clone());
        let snapshot = ActiveSessionRecord {
            request_id,
            intent: self.session.intent.clone(),
            draft: update.draft_text.clone(),
            updates,
        };

        // A durable finalized snapshot always has its archive entry.
        let archived = if update.finalized {
            let entry = HistoryEntry {
                request_id,
                draft_text: update.draft_text.clone(),
                timestamp: Utc::now(),
            };
            if let Err(err) = self.store.append_history(&entry).await {
                self.abandon_stream(request_id);
                return Err(err.into());
            }
            Some(entry)
        } else {
            None
        };
        if let Err(err) = self.store.save_active(&snapshot).await {
            self.abandon_stream(request_id);
            return Err(err.into());
        }

        self.replay_pending = false;
        self.session.updates = snapshot.updates;
        self.session.draft_text = snapshot.draft;
        let _ = self
            .events
            .send(SessionEvent::UpdateApplied { request_id, update });
        if self.session.status == SessionStatus::Revising {
            self.transition(SessionStatus::Streaming);
        }

        if let Some(entry) = archived {
            self.close_subscription();
            self.session.stream_state = StreamState::Ended;
            self.transition(SessionStatus::AwaitingReview);
            info!(
                request_id = request_id.0,
                updates = self.session.updates.len(),
                "session: generation finalized"
            );
            let _ = self.events.send(SessionEvent::Archived(entry));
        }
        Ok(())
    }

    pub async fn edit_draft(&mut self, text: &str) -> Result<(), SessionError> {
        let request_id = self.active_request_id()?;
        if self.subscription.is_some() {
            return Err(SessionError::Precondition(
                "the draft cannot be edited while it is streaming".to_string(),
            ));
        }

        let mut snapshot = self.session.snapshot(request_id);
        snapshot.draft = text.to_string();
        self.store.save_active(&snapshot).await?;
        self.session.draft_text = snapshot.draft;
        Ok(())
    }

    pub async fn approve(&mut self) -> Result<TerminalOutcome, SessionError> {
        let request_id = self.active_request_id()?;
        self.commands
            .approve(request_id, &self.session.draft_text)
            .await?;
        self.finish(request_id, SessionStatus::Approved).await
    }

    pub async fn decline(&mut self, reason: &str) -> Result<TerminalOutcome, SessionError> {
        require_reason(reason)?;
        let request_id = self.active_request_id()?;
        self.commands.decline(request_id, reason).await?;
        self.finish(request_id, SessionStatus::Declined).await
    }

    /// Asks the backend to rerun generation for the same request.
    ///
    /// The old stream stays untouched until the backend accepts the revision.
    pub async fn revise(&mut self, reason: &str) -> Result<(), SessionError> {
        require_reason(reason)?;
        let request_id = self.active_request_id()?;
        self.commands.revise(request_id, reason).await?;

        let mut snapshot = self.session.snapshot(request_id);
        snapshot.draft.clear();
        snapshot.updates.clear();
        self.store.save_active(&snapshot).await?;

        self.close_subscription();
        self.session.updates.clear();
        self.session.draft_text.clear();
        self.replay_pending = false;
        self.transition(SessionStatus::Revising);
        self.open_subscription(request_id);
        info!(request_id = request_id.0, "session: revision requested");
        Ok(())
    }

    /// Reloads the persisted active session, without touching the network.
    ///
    /// A restored run whose last update is finalized awaits review. Any other
    /// restored run is `Streaming` with [`StreamState::Unknown`]: no stream
    /// is attached, the draft stays editable, and the caller decides whether
    /// to [`resume`](Self::resume), revise, decline or approve.
    pub async fn restore(&mut self) -> Result<Option<RequestId>, SessionError> {
        self.recover_abandoned_start();
        if self.session.status != SessionStatus::Idle {
            return Err(SessionError::Precondition(format!(
                "cannot restore over an active session ({})",
                self.session.status
            )));
        }
        let Some(record) = self.store.load_active().await? else {
            return Ok(None);
        };

        let finalized = record.updates.last().is_some_and(|update| update.finalized);
        let (status, stream_state) = if finalized {
            (SessionStatus::AwaitingReview, StreamState::Ended)
        } else {
            (SessionStatus::Streaming, StreamState::Unknown)
        };
        self.session = Session {
            request_id: Some(record.request_id),
            intent: record.intent,
            draft_text: record.draft,
            updates: record.updates,
            status: SessionStatus::Idle,
            stream_state,
        };
        self.replay_pending = false;
        self.transition(status);
        info!(
            request_id = record.request_id.0,
            status = %status,
            updates = self.session.updates.len(),
            "session: restored active session"
        );
        Ok(Some(record.request_id))
    }

    /// Reopens the stream for an unfinished run whose subscription is gone.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        let request_id = self.active_request_id()?;
        if !self.session.status.expects_stream() {
            return Err(SessionError::Precondition(format!(
                "nothing to resume while {}",
                self.session.status
            )));
        }
        if self.subscription.is_some() {
            return Err(SessionError::Precondition(
                "the stream is already live".to_string(),
            ));
        }

        self.replay_pending = !self.session.updates.is_empty();
        self.open_subscription(request_id);
        info!(request_id = request_id.0, "session: stream resumed");
        Ok(())
    }

    async fn finish(
        &mut self,
        request_id: RequestId,
        status: SessionStatus,
    ) -> Result<TerminalOutcome, SessionError> {
        self.store.clear_active().await?;
        self.close_subscription();

        self.transition(status);
        info!(request_id = request_id.0, status = %status, "session: closed");
        self.session = Session {
            status,
            ..Session::default()
        };
        self.replay_pending = false;
        self.transition(SessionStatus::Idle);
        Ok(TerminalOutcome { request_id, status })
    }

    /// Drops the live stream without finishing the run, leaving it to
    /// [`resume`](Self::resume). Events already queued are discarded.
    fn abandon_stream(&mut self, request_id: RequestId) {
        self.close_subscription();
        self.session.stream_state = StreamState::Ended;
        warn!(
            request_id = request_id.0,
            status = %self.session.status,
            "session: stream ended before finalization"
        );
        let _ = self.events.send(SessionEvent::StreamEnded { request_id });
    }

    /// A `start` future dropped while awaiting the backend leaves `Starting`
    /// behind with no request id.
    fn recover_abandoned_start(&mut self) {
        if self.session.status == SessionStatus::Starting && self.session.request_id.is_none() {
            warn!("session: previous start was cancelled, returning to idle");
            self.transition(SessionStatus::Idle);
        }
    }

    fn active_request_id(&self) -> Result<RequestId, SessionError> {
        self.session
            .request_id
            .ok_or_else(|| SessionError::Precondition("no active request".to_string()))
    }

    fn open_subscription(&mut self, request_id: RequestId) {
        self.close_subscription();
        assert!(
            self.subscription.is_none(),
            "at most one live stream subscription per controller"
        );

        let (sink, updates) = mpsc::unbounded_channel();
        let handle = self.streams.open(request_id, sink);
        self.subscription = Some(Subscription { handle, updates });
        self.session.stream_state = StreamState::Live;
    }

    fn close_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.handle.close();
        }
    }

    fn transition(&mut self, to: SessionStatus) {
        let from = self.session.status;
        if from == to {
            return;
        }
        self.session.status = to;
        let _ = self.events.send(SessionEvent::StatusChanged { from, to });
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close_subscription();
    }
}

fn require_reason(reason: &str) -> Result<(), SessionError> {
    if reason.trim().is_empty() {
        return Err(SessionError::Validation(
            "a review note is required".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
