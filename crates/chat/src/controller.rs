//! Conversation Controller: the only place where the session store and the
//! completion client meet.

use std::sync::Arc;

use snafu::{OptionExt, ensure};
use tewahedo_llm::{
    CompletionClient, ProviderMessage, ResponseFragment, ResponseOutcome, create_provider,
};

use crate::catalog::category_question;
use crate::error::{ChatResult, EmptyPromptSnafu, NoActiveSessionSnafu};
use crate::ids::{MessageId, SessionId};
use crate::message::{Message, Role, StreamTarget};
use crate::settings::ChatSettings;
use crate::store::{ResponseEnd, SessionStore, Turn};

/// What one completed `send` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub target: StreamTarget,
    pub user_message_id: MessageId,
    pub model_message_id: MessageId,
    pub outcome: ResponseOutcome,
}

pub struct ConversationController {
    store: Arc<SessionStore>,
    client: CompletionClient,
}

impl ConversationController {
    pub fn new(store: Arc<SessionStore>, client: CompletionClient) -> Self {
        Self { store, client }
    }

    /// Builds the provider from `settings` and creates the startup session. A provider
    /// that cannot be built leaves the client unconfigured, so every response carries
    /// the error notice instead of failing the caller.
    pub fn from_settings(settings: &ChatSettings) -> Self {
        let completion = settings.completion_settings();
        let client = match settings.to_provider_config() {
            None => {
                tracing::warn!(
                    provider_id = %settings.provider_id,
                    "no API key configured, responses will report a connection error"
                );
                CompletionClient::unconfigured("no API key configured", completion)
            }
            Some(config) => match create_provider(config) {
                Ok(provider) => {
                    tracing::info!(
                        provider_id = provider.id(),
                        model = %settings.model,
                        "completion provider ready"
                    );
                    CompletionClient::new(provider, completion)
                }
                Err(error) => {
                    tracing::error!(
                        provider_id = %settings.provider_id,
                        error = %error,
                        "failed to build completion provider"
                    );
                    CompletionClient::unconfigured(error.to_string(), completion)
                }
            },
        };

        let controller = Self::new(Arc::new(SessionStore::new()), client);
        controller.store.ensure_initial_session();
        controller
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    pub fn create_session(&self) -> SessionId {
        self.store.create_session()
    }

    pub fn select_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.store.select_session(session_id)
    }

    /// Sends `text` to `session_id` and streams the answer into a new model message.
    ///
    /// Every rejection (`NoActiveSession`, `EmptyPrompt`, `SessionNotFound`,
    /// `ResponseInFlight`) happens before any state changes. Once the response has
    /// started, the session always leaves `Awaiting`: provider failures end as a
    /// `Failed` outcome with the notice in the model message, and dropping the
    /// returned future marks the response failed.
    pub async fn send(
        &self,
        session_id: Option<SessionId>,
        text: &str,
    ) -> ChatResult<SendReceipt> {
        let session_id = session_id.context(NoActiveSessionSnafu {
            stage: "send-message",
        })?;
        let prompt = text.trim();
        ensure!(
            !prompt.is_empty(),
            EmptyPromptSnafu {
                stage: "send-message",
            }
        );

        let Turn {
            target,
            user_message_id,
            model_message_id,
            history,
        } = self.store.begin_turn(session_id, prompt)?;
        let pending = PendingResponse::new(&self.store, target, model_message_id);
        let history = provider_history(&history);

        tracing::debug!(
            session_id = %session_id,
            request_id = %target.request_id,
            history_len = history.len(),
            "streaming response"
        );

        let mut stream = self.client.complete_stream(target.into(), &history, prompt);
        let mut accumulated = String::new();
        let mut outcome = ResponseOutcome::Failed {
            reason: "stream yielded no terminal fragment".to_string(),
        };

        while let Some(fragment) = stream.next().await {
            match fragment {
                ResponseFragment::Delta(text) => {
                    accumulated.push_str(&text);
                    if let Err(error) = self.store.update_message_content(
                        session_id,
                        model_message_id,
                        accumulated.as_str(),
                    ) {
                        tracing::error!(
                            session_id = %session_id,
                            message_id = %model_message_id,
                            error = %error,
                            "failed to record streamed fragment"
                        );
                    }
                }
                ResponseFragment::Done => outcome = ResponseOutcome::Completed,
                ResponseFragment::Failed { reason } => outcome = ResponseOutcome::Failed { reason },
            }
        }

        pending.finish(match &outcome {
            ResponseOutcome::Completed => ResponseEnd::Completed,
            ResponseOutcome::Failed { reason } => ResponseEnd::Failed(reason.clone()),
        });

        Ok(SendReceipt {
            target,
            user_message_id,
            model_message_id,
            outcome,
        })
    }

    /// Sends to whichever session is active.
    pub async fn send_active(&self, text: &str) -> ChatResult<SendReceipt> {
        self.send(self.store.active_session_id(), text).await
    }

    pub async fn send_from_category(&self, label: &str) -> ChatResult<SendReceipt> {
        self.send_active(&category_question(label)).await
    }
}

/// Prior turns in provider form. Empty model turns carry nothing worth sending.
fn provider_history(messages: &[Message]) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|message| !message.content.trim().is_empty())
        .map(|message| match message.role {
            Role::User => ProviderMessage::user(message.content.clone()),
            Role::Model => ProviderMessage::assistant(message.content.clone()),
        })
        .collect()
}

/// Ends an in-flight response exactly once, even if the `send` future is dropped.
struct PendingResponse<'a> {
    store: &'a SessionStore,
    target: StreamTarget,
    model_message_id: MessageId,
    finished: bool,
}

impl<'a> PendingResponse<'a> {
    fn new(store: &'a SessionStore, target: StreamTarget, model_message_id: MessageId) -> Self {
        Self {
            store,
            target,
            model_message_id,
            finished: false,
        }
    }

    fn finish(mut self, end: ResponseEnd) {
        self.finished = true;
        self.record(end);
    }

    fn record(&self, end: ResponseEnd) {
        if let Err(error) = self
            .store
            .finish_response(self.target, self.model_message_id, end)
        {
            tracing::error!(
                target = ?self.target,
                error = %error,
                "failed to finalize response"
            );
        }
    }
}

impl Drop for PendingResponse<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(target = ?self.target, "send dropped before its response finished");
            self.record(ResponseEnd::Failed(
                "response abandoned before completion".to_string(),
            ));
        }
    }
}
