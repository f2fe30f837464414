//! Session State Store: the single source of truth for sessions and the active selection.
//!
//! State lives in an immutable [`ChatState`] snapshot behind an [`ArcSwap`]. A mutation
//! copies the snapshot (sessions are `Arc`-shared, so only the touched session is cloned),
//! applies the change and swaps the result in, so readers never see a half-applied edit.
//! Every effective mutation bumps a revision published on a `watch` channel.

use std::sync::Arc;

use arc_swap::ArcSwap;
use snafu::{OptionExt, ensure};
use tokio::sync::watch;

use crate::error::{
    ChatError, ChatResult, MessageFinalizedSnafu, MessageNotFoundSnafu, ResponseInFlightSnafu,
    SessionNotFoundSnafu, StreamTransitionSnafu,
};
use crate::ids::{MessageId, RequestId, SessionId};
use crate::message::{
    ChatSession, Message, MessageStatus, StreamTarget, StreamTransition, StreamTransitionRejection,
    current_unix_timestamp_seconds, derive_title,
};

/// Immutable view of all sessions, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatState {
    pub sessions: Vec<Arc<ChatSession>>,
    pub active_session_id: Option<SessionId>,
}

impl ChatState {
    pub fn session(&self, session_id: SessionId) -> Option<&ChatSession> {
        self.sessions
            .iter()
            .find(|session| session.id == session_id)
            .map(Arc::as_ref)
    }

    /// Returns the active session; `None` when unset or dangling.
    pub fn active_session(&self) -> Option<&ChatSession> {
        self.active_session_id
            .and_then(|session_id| self.session(session_id))
    }

    /// True while any session is producing a response; drives the loading indicator.
    pub fn any_awaiting(&self) -> bool {
        self.sessions.iter().any(|session| session.is_awaiting())
    }

    fn session_mut(&mut self, session_id: SessionId) -> Option<&mut ChatSession> {
        self.sessions
            .iter_mut()
            .find(|session| session.id == session_id)
            .map(Arc::make_mut)
    }

    fn require_session_mut(
        &mut self,
        session_id: SessionId,
        stage: &'static str,
    ) -> ChatResult<&mut ChatSession> {
        self.session_mut(session_id)
            .context(SessionNotFoundSnafu { stage, session_id })
    }
}

/// How a response ended, as recorded on its model message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEnd {
    Completed,
    Failed(String),
}

/// A turn opened by [`SessionStore::begin_turn`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub target: StreamTarget,
    pub user_message_id: MessageId,
    pub model_message_id: MessageId,
    /// Messages that preceded this turn.
    pub history: Vec<Message>,
}

/// Whether a mutation changed anything observable.
enum Change<T> {
    Applied(T),
    Unchanged(T),
}

pub struct SessionStore {
    state: ArcSwap<ChatState>,
    revision: watch::Sender<u64>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: ArcSwap::from_pointee(ChatState::default()),
            revision,
        }
    }

    pub fn snapshot(&self) -> Arc<ChatState> {
        self.state.load_full()
    }

    pub fn active_session_id(&self) -> Option<SessionId> {
        self.state.load().active_session_id
    }

    /// Receiver that changes whenever the store does.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Creates the startup session when the collection is empty.
    pub fn ensure_initial_session(&self) -> SessionId {
        let candidate = SessionId::new_v7();
        let now = current_unix_timestamp_seconds();
        let ensured = self.mutate(|state| {
            if let Some(existing) = state
                .active_session()
                .or_else(|| state.sessions.first().map(Arc::as_ref))
                .map(|session| session.id)
            {
                if state.active_session_id == Some(existing) {
                    return Ok(Change::Unchanged(existing));
                }
                state.active_session_id = Some(existing);
                return Ok(Change::Applied(existing));
            }

            state
                .sessions
                .insert(0, Arc::new(ChatSession::new(candidate, now)));
            state.active_session_id = Some(candidate);
            Ok(Change::Applied(candidate))
        });

        // The closure never fails.
        ensured.unwrap_or(candidate)
    }

    /// Prepends a new empty session and makes it active.
    pub fn create_session(&self) -> SessionId {
        let session_id = SessionId::new_v7();
        let now = current_unix_timestamp_seconds();
        let _ = self.mutate(|state| {
            state
                .sessions
                .insert(0, Arc::new(ChatSession::new(session_id, now)));
            state.active_session_id = Some(session_id);
            Ok(Change::Applied(()))
        });
        tracing::debug!(session_id = %session_id, "created chat session");
        session_id
    }

    /// Makes `session_id` active. Unknown ids are rejected and leave the selection alone.
    pub fn select_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.mutate(|state| {
            ensure!(
                state.session(session_id).is_some(),
                SessionNotFoundSnafu {
                    stage: "select-session",
                    session_id,
                }
            );

            if state.active_session_id == Some(session_id) {
                return Ok(Change::Unchanged(()));
            }
            state.active_session_id = Some(session_id);
            Ok(Change::Applied(()))
        })
    }

    /// Appends a user message; the first one also names the session.
    pub fn append_user_message(
        &self,
        session_id: SessionId,
        text: impl Into<String>,
    ) -> ChatResult<MessageId> {
        let text = text.into();
        let message_id = MessageId::new_v7();
        let now = current_unix_timestamp_seconds();

        self.mutate(|state| {
            let session = state.require_session_mut(session_id, "append-user-message")?;
            if session.messages.is_empty() {
                session.title = derive_title(&text);
            }
            session
                .messages
                .push(Message::user(message_id, text.clone(), now));
            session.updated_at_unix_seconds = now;
            Ok(Change::Applied(message_id))
        })
    }

    /// Appends the empty model message that streamed content will fill.
    pub fn append_empty_model_message(&self, session_id: SessionId) -> ChatResult<MessageId> {
        let message_id = MessageId::new_v7();
        let now = current_unix_timestamp_seconds();

        self.mutate(|state| {
            let session = state.require_session_mut(session_id, "append-model-message")?;
            session
                .messages
                .push(Message::model_streaming(message_id, now));
            session.updated_at_unix_seconds = now;
            Ok(Change::Applied(message_id))
        })
    }

    /// Replaces a streaming message's content with the cumulative text so far.
    pub fn update_message_content(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        content: impl Into<String>,
    ) -> ChatResult<()> {
        let content = content.into();
        let now = current_unix_timestamp_seconds();

        self.mutate(|state| {
            let message = Self::require_message(state, session_id, message_id)?;
            ensure!(
                message.is_streaming(),
                MessageFinalizedSnafu {
                    stage: "update-message-content",
                    message_id,
                }
            );
            if message.content == content {
                return Ok(Change::Unchanged(()));
            }

            let session = state.require_session_mut(session_id, "update-message-content")?;
            let Some(message) = session.message_mut(message_id) else {
                return MessageNotFoundSnafu {
                    stage: "update-message-content",
                    session_id,
                    message_id,
                }
                .fail();
            };
            message.content.clone_from(&content);
            session.updated_at_unix_seconds = now;
            Ok(Change::Applied(()))
        })
    }

    /// Moves the session into `Awaiting` under a fresh request id.
    pub fn begin_response(&self, session_id: SessionId) -> ChatResult<StreamTarget> {
        let target = StreamTarget::new(session_id, RequestId::new_v7());

        self.mutate(|state| {
            let session = state.require_session_mut(session_id, "begin-response")?;
            start_response(session, target, "begin-response")?;
            Ok(Change::Applied(target))
        })
    }

    /// Opens a full turn in one snapshot: the session enters `Awaiting`, the user
    /// message and the empty model message are appended together. Readers never see
    /// an awaiting session without its new user message.
    pub fn begin_turn(&self, session_id: SessionId, text: impl Into<String>) -> ChatResult<Turn> {
        let text = text.into();
        let target = StreamTarget::new(session_id, RequestId::new_v7());
        let user_message_id = MessageId::new_v7();
        let model_message_id = MessageId::new_v7();
        let now = current_unix_timestamp_seconds();

        self.mutate(|state| {
            let session = state.require_session_mut(session_id, "begin-turn")?;
            start_response(session, target, "begin-turn")?;

            let history = session.messages.clone();
            if session.messages.is_empty() {
                session.title = derive_title(&text);
            }
            session
                .messages
                .push(Message::user(user_message_id, text.clone(), now));
            session
                .messages
                .push(Message::model_streaming(model_message_id, now));
            session.updated_at_unix_seconds = now;

            Ok(Change::Applied(Turn {
                target,
                user_message_id,
                model_message_id,
                history,
            }))
        })
    }

    /// Ends the response for `target` and freezes its model message.
    pub fn finish_response(
        &self,
        target: StreamTarget,
        model_message_id: MessageId,
        end: ResponseEnd,
    ) -> ChatResult<()> {
        let now = current_unix_timestamp_seconds();

        self.mutate(|state| {
            let session = state.require_session_mut(target.session_id, "finish-response")?;
            let (transition, status) = match &end {
                ResponseEnd::Completed => {
                    (StreamTransition::Complete(target), MessageStatus::Done)
                }
                ResponseEnd::Failed(reason) => (
                    StreamTransition::Fail {
                        target,
                        message: reason.clone(),
                    },
                    MessageStatus::Failed(reason.clone()),
                ),
            };

            session
                .apply_stream_transition(transition)
                .map_err(|rejection| ChatError::StreamTransition {
                    stage: "finish-response",
                    rejection,
                })?;

            if let Some(message) = session.message_mut(model_message_id) {
                message.status = status;
            }
            session.updated_at_unix_seconds = now;
            Ok(Change::Applied(()))
        })
    }

    fn require_message(
        state: &ChatState,
        session_id: SessionId,
        message_id: MessageId,
    ) -> ChatResult<&Message> {
        let session = state.session(session_id).context(SessionNotFoundSnafu {
            stage: "find-message",
            session_id,
        })?;
        session.message(message_id).context(MessageNotFoundSnafu {
            stage: "find-message",
            session_id,
            message_id,
        })
    }

    /// Runs `apply` against a copy of the current snapshot and publishes the copy only
    /// when the change was applied. `apply` may run more than once under contention.
    fn mutate<T>(
        &self,
        mut apply: impl FnMut(&mut ChatState) -> ChatResult<Change<T>>,
    ) -> ChatResult<T> {
        let mut outcome = None;

        self.state.rcu(|current| {
            let mut next = ChatState::clone(current);
            match apply(&mut next) {
                Ok(Change::Applied(value)) => {
                    outcome = Some(Ok((value, true)));
                    Arc::new(next)
                }
                Ok(Change::Unchanged(value)) => {
                    outcome = Some(Ok((value, false)));
                    Arc::clone(current)
                }
                Err(error) => {
                    outcome = Some(Err(error));
                    Arc::clone(current)
                }
            }
        });

        match outcome {
            Some(Ok((value, applied))) => {
                if applied {
                    self.revision.send_modify(|revision| *revision += 1);
                }
                Ok(value)
            }
            Some(Err(error)) => Err(error),
            None => unreachable!("rcu always runs its closure at least once"),
        }
    }
}

fn start_response(
    session: &mut ChatSession,
    target: StreamTarget,
    stage: &'static str,
) -> ChatResult<()> {
    match session.apply_stream_transition(StreamTransition::Start(target)) {
        Ok(_) => Ok(()),
        Err(StreamTransitionRejection::AlreadyAwaiting { active, .. }) => ResponseInFlightSnafu {
            stage,
            session_id: target.session_id,
            active,
        }
        .fail(),
        Err(rejection) => StreamTransitionSnafu { stage, rejection }.fail(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DEFAULT_SESSION_TITLE, ResponseState, Role};

    #[test]
    fn created_sessions_are_most_recent_first_and_active() {
        let store = SessionStore::new();
        let mut created = Vec::new();

        for _ in 0..4 {
            let session_id = store.create_session();
            created.push(session_id);
            assert_eq!(store.active_session_id(), Some(session_id));
        }

        let snapshot = store.snapshot();
        let ids = snapshot
            .sessions
            .iter()
            .map(|session| session.id)
            .collect::<Vec<_>>();
        created.reverse();
        assert_eq!(ids, created);
        assert!(
            snapshot
                .sessions
                .iter()
                .all(|session| session.title == DEFAULT_SESSION_TITLE)
        );
    }

    #[test]
    fn initial_session_is_created_only_once() {
        let store = SessionStore::new();
        let first = store.ensure_initial_session();
        let again = store.ensure_initial_session();

        assert_eq!(first, again);
        assert_eq!(store.snapshot().sessions.len(), 1);
        assert_eq!(store.active_session_id(), Some(first));
    }

    #[test]
    fn select_rejects_unknown_session_and_keeps_selection() {
        let store = SessionStore::new();
        let first = store.create_session();
        let second = store.create_session();

        store.select_session(first).expect("known session");
        assert_eq!(store.active_session_id(), Some(first));

        let error = store
            .select_session(SessionId::new_v7())
            .expect_err("unknown session");
        assert!(matches!(error, ChatError::SessionNotFound { .. }));
        assert_eq!(store.active_session_id(), Some(first));
        assert_ne!(first, second);
    }

    #[test]
    fn first_user_message_sets_title_once() {
        let store = SessionStore::new();
        let session_id = store.create_session();

        store
            .append_user_message(session_id, "Tell me about the Kebra Nagast and its origins")
            .expect("session exists");
        store
            .append_user_message(session_id, "Short follow-up")
            .expect("session exists");

        let snapshot = store.snapshot();
        let session = snapshot.session(session_id).expect("session exists");
        assert_eq!(session.title, "Tell me about the Kebra Nagast...");
        assert_eq!(session.messages.len(), 2);
        assert!(
            session
                .messages
                .iter()
                .all(|message| message.role == Role::User)
        );
    }

    #[test]
    fn append_to_unknown_session_reports_and_changes_nothing() {
        let store = SessionStore::new();
        store.create_session();
        let before = store.snapshot();
        let revision = store.revision();

        let error = store
            .append_user_message(SessionId::new_v7(), "lost?")
            .expect_err("unknown session");

        assert!(matches!(error, ChatError::SessionNotFound { .. }));
        assert_eq!(*store.snapshot(), *before);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn repeated_cumulative_update_is_idempotent() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let message_id = store
            .append_empty_model_message(session_id)
            .expect("session exists");

        store
            .update_message_content(session_id, message_id, "Blessed are")
            .expect("streaming message");
        let revision = store.revision();
        store
            .update_message_content(session_id, message_id, "Blessed are")
            .expect("same content again");

        let snapshot = store.snapshot();
        let session = snapshot.session(session_id).expect("session exists");
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "Blessed are");
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn finalized_messages_reject_updates() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let user_id = store
            .append_user_message(session_id, "What is Filseta?")
            .expect("session exists");

        let error = store
            .update_message_content(session_id, user_id, "edited")
            .expect_err("user messages are immutable");
        assert!(matches!(error, ChatError::MessageFinalized { .. }));

        let error = store
            .update_message_content(session_id, MessageId::new_v7(), "x")
            .expect_err("unknown message");
        assert!(matches!(error, ChatError::MessageNotFound { .. }));
    }

    #[test]
    fn response_lifecycle_freezes_model_message() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let target = store.begin_response(session_id).expect("idle session");
        let model_id = store
            .append_empty_model_message(session_id)
            .expect("session exists");
        assert!(store.snapshot().any_awaiting());

        let error = store
            .begin_response(session_id)
            .expect_err("second request while awaiting");
        assert!(matches!(error, ChatError::ResponseInFlight { active, .. } if active == target));

        store
            .update_message_content(session_id, model_id, "Peace be unto you")
            .expect("streaming message");
        store
            .finish_response(target, model_id, ResponseEnd::Completed)
            .expect("matching target");

        let snapshot = store.snapshot();
        let session = snapshot.session(session_id).expect("session exists");
        assert_eq!(session.response_state, ResponseState::Done(target));
        assert_eq!(session.messages[0].status, MessageStatus::Done);
        assert!(!snapshot.any_awaiting());

        let error = store
            .update_message_content(session_id, model_id, "late fragment")
            .expect_err("finished message is frozen");
        assert!(matches!(error, ChatError::MessageFinalized { .. }));

        let error = store
            .update_message_content(session_id, model_id, "Peace be unto you")
            .expect_err("same content on a frozen message is still rejected");
        assert!(matches!(error, ChatError::MessageFinalized { .. }));
    }

    #[test]
    fn begin_turn_publishes_reservation_and_messages_together() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let mut receiver = store.subscribe();
        receiver.borrow_and_update();
        let revision = store.revision();

        let turn = store
            .begin_turn(session_id, "What is Timkat?")
            .expect("idle session");

        assert_eq!(store.revision(), revision + 1);
        assert!(receiver.has_changed().expect("sender alive"));
        assert!(turn.history.is_empty());

        let snapshot = store.snapshot();
        let session = snapshot.session(session_id).expect("session exists");
        assert_eq!(session.response_state, ResponseState::Awaiting(turn.target));
        assert_eq!(session.title, "What is Timkat?");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].id, turn.user_message_id);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].id, turn.model_message_id);
        assert!(session.messages[1].is_streaming());
    }

    #[test]
    fn begin_turn_on_awaiting_session_changes_nothing() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let first = store
            .begin_turn(session_id, "What is Meskel?")
            .expect("idle session");
        let before = store.snapshot();
        let revision = store.revision();

        let error = store
            .begin_turn(session_id, "And Ganna?")
            .expect_err("session is busy");

        assert!(
            matches!(error, ChatError::ResponseInFlight { active, .. } if active == first.target)
        );
        assert_eq!(*store.snapshot(), *before);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn begin_turn_history_holds_prior_messages_only() {
        let store = SessionStore::new();
        let session_id = store.create_session();
        let first = store
            .begin_turn(session_id, "What is Timkat?")
            .expect("idle session");
        store
            .update_message_content(session_id, first.model_message_id, "Epiphany.")
            .expect("streaming message");
        store
            .finish_response(first.target, first.model_message_id, ResponseEnd::Completed)
            .expect("matching target");

        let second = store
            .begin_turn(session_id, "When is it?")
            .expect("finished session accepts a new turn");

        let contents = second
            .history
            .iter()
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>();
        assert_eq!(contents, vec!["What is Timkat?", "Epiphany."]);
    }

    #[test]
    fn mutations_notify_subscribers() {
        let store = SessionStore::new();
        let mut receiver = store.subscribe();
        receiver.borrow_and_update();

        let session_id = store.create_session();
        assert!(receiver.has_changed().expect("sender alive"));
        receiver.borrow_and_update();

        store.select_session(session_id).expect("already active");
        assert!(!receiver.has_changed().expect("sender alive"));
    }
}
