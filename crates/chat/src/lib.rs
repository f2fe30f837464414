#![deny(unsafe_code)]

pub mod catalog;
pub mod controller;
pub mod error;
pub mod ids;
pub mod message;
pub mod settings;
pub mod store;

pub use catalog::{
    CATEGORIES, Category, STARTER_QUESTIONS, SYSTEM_INSTRUCTION, category_question, find_category,
};
pub use controller::{ConversationController, SendReceipt};
pub use error::{ChatError, ChatResult};
pub use ids::{MessageId, RequestId, SessionId};
pub use message::{
    ChatSession, DEFAULT_SESSION_TITLE, Message, MessageStatus, ResponseState, Role,
    StreamTarget, StreamTransition, StreamTransitionRejection, derive_title,
};
pub use settings::{ChatSettings, SettingsError, SettingsStore};
pub use store::{ChatState, ResponseEnd, SessionStore, Turn};
pub use tewahedo_llm::{ResponseOutcome, STREAM_ERROR_NOTICE};
