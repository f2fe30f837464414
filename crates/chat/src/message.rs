use std::time::{SystemTime, UNIX_EPOCH};

use crate::ids::{MessageId, RequestId, SessionId};

/// Title shown until the first user message names the session.
pub const DEFAULT_SESSION_TITLE: &str = "New Discussion";
/// Longest title, in characters, taken from the first user message.
pub const TITLE_MAX_CHARS: usize = 30;
pub const TITLE_ELLIPSIS: &str = "...";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// Model output still arriving; the only status that accepts content updates.
    Streaming,
    Done,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub created_at_unix_seconds: u64,
}

impl Message {
    pub fn user(id: MessageId, content: impl Into<String>, created_at_unix_seconds: u64) -> Self {
        Self {
            id,
            role: Role::User,
            content: content.into(),
            status: MessageStatus::Done,
            created_at_unix_seconds,
        }
    }

    /// Creates the empty model placeholder that streamed fragments fill in.
    pub fn model_streaming(id: MessageId, created_at_unix_seconds: u64) -> Self {
        Self {
            id,
            role: Role::Model,
            content: String::new(),
            status: MessageStatus::Streaming,
            created_at_unix_seconds,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming)
    }
}

/// Routing key for one response: the session plus a request id minted per send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub request_id: RequestId,
}

impl StreamTarget {
    pub const fn new(session_id: SessionId, request_id: RequestId) -> Self {
        Self {
            session_id,
            request_id,
        }
    }
}

impl From<StreamTarget> for tewahedo_llm::StreamTarget {
    fn from(target: StreamTarget) -> Self {
        tewahedo_llm::StreamTarget::new(target.session_id.into(), target.request_id.into())
    }
}

/// One independent conversation thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub id: SessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub updated_at_unix_seconds: u64,
    pub response_state: ResponseState,
}

impl ChatSession {
    pub fn new(id: SessionId, updated_at_unix_seconds: u64) -> Self {
        Self {
            id,
            title: DEFAULT_SESSION_TITLE.to_string(),
            messages: Vec::new(),
            updated_at_unix_seconds,
            response_state: ResponseState::Idle,
        }
    }

    pub fn is_awaiting(&self) -> bool {
        self.response_state.active_target().is_some()
    }

    pub fn message(&self, message_id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == message_id)
    }

    pub(crate) fn message_mut(&mut self, message_id: MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == message_id)
    }

    /// Applies a deterministic response-state transition.
    pub fn apply_stream_transition(
        &mut self,
        transition: StreamTransition,
    ) -> StreamTransitionResult {
        let next_state = self.response_state.apply(transition)?;
        self.response_state = next_state.clone();
        Ok(next_state)
    }
}

/// Title for a session whose first user message is `text`.
pub fn derive_title(text: &str) -> String {
    if text.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }

    let mut characters = text.chars();
    let head = characters
        .by_ref()
        .take(TITLE_MAX_CHARS)
        .collect::<String>();

    if characters.next().is_some() {
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        head
    }
}

/// Per-session response lifecycle. `Awaiting` gates new sends on that session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResponseState {
    #[default]
    Idle,
    Awaiting(StreamTarget),
    Done(StreamTarget),
    Failed {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyAwaiting {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveRequest,
    RequestMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<ResponseState, StreamTransitionRejection>;

impl ResponseState {
    /// Returns the in-flight target if and only if the state is `Awaiting`.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Awaiting(target) => Some(*target),
            Self::Idle | Self::Done(_) | Self::Failed { .. } => None,
        }
    }

    /// Non-awaiting states may start a new request directly. Terminal transitions
    /// must name the in-flight request exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, ResponseState::Done(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, ResponseState::Failed { target, message })
            }
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Awaiting(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyAwaiting {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Awaiting(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Failed { .. } => Ok(Self::Awaiting(target)),
        }
    }

    fn apply_terminal(&self, target: StreamTarget, next: ResponseState) -> StreamTransitionResult {
        match self {
            Self::Awaiting(active) if *active == target => Ok(next),
            Self::Awaiting(active) => Err(StreamTransitionRejection::RequestMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Failed { .. } => {
                Err(StreamTransitionRejection::NoActiveRequest)
            }
        }
    }
}

pub(crate) fn current_unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
