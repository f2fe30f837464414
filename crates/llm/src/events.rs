use uuid::Uuid;

/// Stream routing key used for stale-chunk rejection.
///
/// `request_id` changes on every send so events from an earlier request can never
/// land in a newer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: Uuid,
    pub request_id: Uuid,
}

impl StreamTarget {
    pub const fn new(conversation_id: Uuid, request_id: Uuid) -> Self {
        Self {
            conversation_id,
            request_id,
        }
    }
}

/// Provider-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    Error(String),
}

/// One provider stream event routed to its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn new(target: StreamTarget, payload: StreamEventPayload) -> Self {
        Self { target, payload }
    }

    /// Returns true for `Done` and `Error`, the payloads that close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            StreamEventPayload::Done | StreamEventPayload::Error(_)
        )
    }
}
