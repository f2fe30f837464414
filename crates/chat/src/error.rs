use snafu::Snafu;

use crate::ids::{MessageId, SessionId};
use crate::message::{StreamTarget, StreamTransitionRejection};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("no active session to send to"))]
    NoActiveSession { stage: &'static str },
    #[snafu(display("session '{session_id}' was not found"))]
    SessionNotFound {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("message '{message_id}' was not found in session '{session_id}'"))]
    MessageNotFound {
        stage: &'static str,
        session_id: SessionId,
        message_id: MessageId,
    },
    #[snafu(display("message '{message_id}' is finalized and cannot change"))]
    MessageFinalized {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("session '{session_id}' is already awaiting {active:?}"))]
    ResponseInFlight {
        stage: &'static str,
        session_id: SessionId,
        active: StreamTarget,
    },
    #[snafu(display("stream transition rejected on `{stage}`: {rejection:?}"))]
    StreamTransition {
        stage: &'static str,
        rejection: StreamTransitionRejection,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
