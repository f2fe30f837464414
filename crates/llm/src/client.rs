//! Completion client that never fails past its own boundary.
//!
//! Provider errors are logged and folded into user-facing text: a fallback string
//! for [`CompletionClient::complete`], or a notice fragment followed by a
//! [`ResponseFragment::Failed`] sentinel for [`CompletionClient::complete_stream`].

use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use crate::events::{StreamEventPayload, StreamTarget};
use crate::provider::{
    ChatRequest, LlmProvider, ProviderError, ProviderEventStream, ProviderMessage, Sampling,
};

pub const STREAM_ERROR_NOTICE: &str = "\n\n[Error: Connection interrupted. Please consult Church tradition or retry your question.]";
pub const COMPLETION_FAILED_FALLBACK: &str =
    "I encountered a spiritual/technical difficulty. Please check your connection and try again.";
pub const EMPTY_COMPLETION_FALLBACK: &str =
    "I apologize, I could not generate a response. Please try again.";

/// User-facing texts substituted for provider failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackNotices {
    pub stream_error: String,
    pub completion_failed: String,
    pub empty_completion: String,
}

impl Default for FallbackNotices {
    fn default() -> Self {
        Self {
            stream_error: STREAM_ERROR_NOTICE.to_string(),
            completion_failed: COMPLETION_FAILED_FALLBACK.to_string(),
            empty_completion: EMPTY_COMPLETION_FALLBACK.to_string(),
        }
    }
}

/// Fixed request parameters attached to every call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub model_id: String,
    pub system_instruction: Option<String>,
    pub sampling: Sampling,
    pub notices: FallbackNotices,
}

impl CompletionSettings {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system_instruction: None,
            sampling: Sampling::default(),
            notices: FallbackNotices::default(),
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }
}

/// One item drained from a [`ResponseStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFragment {
    /// New text to append; never the cumulative response.
    Delta(String),
    Done,
    Failed { reason: String },
}

/// How a streamed response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Completed,
    Failed { reason: String },
}

enum Backend {
    Ready(Arc<dyn LlmProvider>),
    Unconfigured { reason: String },
}

pub struct CompletionClient {
    backend: Backend,
    settings: CompletionSettings,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn LlmProvider>, settings: CompletionSettings) -> Self {
        Self {
            backend: Backend::Ready(provider),
            settings,
        }
    }

    /// A client whose every call fails with `reason`, still honouring the
    /// fallback contract.
    pub fn unconfigured(reason: impl Into<String>, settings: CompletionSettings) -> Self {
        Self {
            backend: Backend::Unconfigured {
                reason: reason.into(),
            },
            settings,
        }
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    pub fn is_configured(&self) -> bool {
        matches!(self.backend, Backend::Ready(_))
    }

    /// Builds the provider request: history in order, then the prompt as a user turn.
    pub fn build_request(
        &self,
        target: StreamTarget,
        history: &[ProviderMessage],
        prompt: &str,
    ) -> ChatRequest {
        let mut messages = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>();
        messages.push(ProviderMessage::user(prompt));

        let mut request = ChatRequest::new(target, self.settings.model_id.clone(), messages)
            .with_sampling(self.settings.sampling);
        if let Some(instruction) = &self.settings.system_instruction {
            request = request.with_preamble(instruction.clone());
        }
        request
    }

    /// Resolves the response in one piece. Failures come back as fallback text.
    pub async fn complete(&self, history: &[ProviderMessage], prompt: &str) -> String {
        let target = StreamTarget::new(Uuid::nil(), Uuid::now_v7());
        let request = self.build_request(target, history, prompt);

        let provider = match &self.backend {
            Backend::Ready(provider) => provider,
            Backend::Unconfigured { reason } => {
                tracing::error!(error = %reason, "completion requested without a configured provider");
                return self.settings.notices.completion_failed.clone();
            }
        };

        match provider.complete(request).await {
            Ok(text) if text.trim().is_empty() => {
                tracing::warn!(provider_id = provider.id(), "provider returned an empty completion");
                self.settings.notices.empty_completion.clone()
            }
            Ok(text) => text,
            Err(error) => {
                tracing::error!(
                    provider_id = provider.id(),
                    error = %error,
                    "completion request failed"
                );
                self.settings.notices.completion_failed.clone()
            }
        }
    }

    /// Starts a streamed response. The provider worker is spawned on the current
    /// tokio runtime, so this must be called from within one.
    pub fn complete_stream(
        &self,
        target: StreamTarget,
        history: &[ProviderMessage],
        prompt: &str,
    ) -> ResponseStream {
        let notice = self.settings.notices.stream_error.clone();
        let provider = match &self.backend {
            Backend::Ready(provider) => provider,
            Backend::Unconfigured { reason } => {
                return ResponseStream::failed(target, notice, reason.clone());
            }
        };

        let request = self.build_request(target, history, prompt);
        match provider.stream_chat(request) {
            Ok(handle) => {
                tokio::spawn(handle.worker);
                ResponseStream::live(notice, handle.stream)
            }
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = provider.id(),
                    error = %error,
                    "failed to start provider stream"
                );
                ResponseStream::failed(target, notice, error.to_string())
            }
        }
    }

    /// Callback form of [`Self::complete_stream`]: `on_fragment` sees every delta,
    /// including the error notice, in arrival order.
    pub async fn complete_stream_with<F>(
        &self,
        target: StreamTarget,
        history: &[ProviderMessage],
        prompt: &str,
        mut on_fragment: F,
    ) -> ResponseOutcome
    where
        F: FnMut(&str),
    {
        let mut stream = self.complete_stream(target, history, prompt);
        let mut outcome = ResponseOutcome::Failed {
            reason: "stream yielded no terminal fragment".to_string(),
        };

        while let Some(fragment) = stream.next().await {
            match fragment {
                ResponseFragment::Delta(text) => on_fragment(&text),
                ResponseFragment::Done => outcome = ResponseOutcome::Completed,
                ResponseFragment::Failed { reason } => outcome = ResponseOutcome::Failed { reason },
            }
        }

        outcome
    }
}

/// Ordered fragments of one response, closed by exactly one `Done` or `Failed`.
pub struct ResponseStream {
    target: StreamTarget,
    notice: String,
    events: Option<ProviderEventStream>,
    queued: VecDeque<ResponseFragment>,
    finished: bool,
}

impl ResponseStream {
    fn live(notice: String, events: ProviderEventStream) -> Self {
        Self {
            target: events.target(),
            notice,
            events: Some(events),
            queued: VecDeque::new(),
            finished: false,
        }
    }

    fn failed(target: StreamTarget, notice: String, reason: String) -> Self {
        let mut stream = Self {
            target,
            notice,
            events: None,
            queued: VecDeque::new(),
            finished: false,
        };
        let notice = stream.fail(reason);
        stream.queued.push_front(notice);
        stream
    }

    /// Returns the next fragment, or `None` once the terminal sentinel was yielded.
    pub async fn next(&mut self) -> Option<ResponseFragment> {
        if let Some(fragment) = self.queued.pop_front() {
            return Some(fragment);
        }

        if self.finished {
            return None;
        }

        let Some(events) = self.events.as_mut() else {
            self.finished = true;
            return None;
        };

        loop {
            let Some(event) = events.recv().await else {
                let error = ProviderError::StreamFailed {
                    stage: "stream-closed",
                    message: "provider stream ended before a terminal event".to_string(),
                };
                return Some(self.fail(error.to_string()));
            };

            if event.target != self.target {
                tracing::debug!(
                    expected = ?self.target,
                    received = ?event.target,
                    "dropping stream event for another target"
                );
                continue;
            }

            match event.payload {
                StreamEventPayload::Delta(text) if text.is_empty() => continue,
                StreamEventPayload::Delta(text) => return Some(ResponseFragment::Delta(text)),
                StreamEventPayload::Done => {
                    self.finish();
                    return Some(ResponseFragment::Done);
                }
                StreamEventPayload::Error(reason) => return Some(self.fail(reason)),
            }
        }
    }

    /// Logs the raw failure, queues the `Failed` sentinel and returns the notice delta.
    fn fail(&mut self, reason: String) -> ResponseFragment {
        tracing::error!(target = ?self.target, error = %reason, "streamed response failed");
        self.finish();
        self.queued.push_back(ResponseFragment::Failed { reason });
        ResponseFragment::Delta(self.notice.clone())
    }

    fn finish(&mut self) {
        self.finished = true;
        // Dropping the receiver releases the worker.
        self.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;
    use crate::testing::ScriptedProvider;

    fn target() -> StreamTarget {
        StreamTarget::new(Uuid::now_v7(), Uuid::now_v7())
    }

    fn client_with(provider: Arc<ScriptedProvider>) -> CompletionClient {
        CompletionClient::new(
            provider,
            CompletionSettings::new("gemini-test").with_system_instruction("Be reverent."),
        )
    }

    async fn drain(stream: &mut ResponseStream) -> Vec<ResponseFragment> {
        let mut fragments = Vec::new();
        while let Some(fragment) = stream.next().await {
            fragments.push(fragment);
        }
        fragments
    }

    #[test]
    fn request_appends_prompt_after_history_and_drops_empty_turns() {
        let client = CompletionClient::unconfigured("no key", CompletionSettings::new("m"));
        let history = vec![
            ProviderMessage::user("What is Timkat?"),
            ProviderMessage::assistant(""),
            ProviderMessage::assistant("Timkat is the feast of Epiphany."),
        ];

        let request = client.build_request(target(), &history, "When is it celebrated?");

        let turns = request
            .messages
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            turns,
            vec![
                (Role::User, "What is Timkat?"),
                (Role::Assistant, "Timkat is the feast of Epiphany."),
                (Role::User, "When is it celebrated?"),
            ]
        );
        assert_eq!(request.sampling, Sampling::default());
        assert_eq!(request.model_id, "m");
    }

    #[tokio::test]
    async fn stream_yields_deltas_in_order_then_done() {
        let provider = Arc::new(ScriptedProvider::streaming([
            "Blessed ",
            "are ",
            "the peacemakers.",
        ]));
        let client = client_with(provider.clone());

        let mut stream = client.complete_stream(target(), &[], "Recite a beatitude");
        let fragments = drain(&mut stream).await;

        assert_eq!(
            fragments,
            vec![
                ResponseFragment::Delta("Blessed ".to_string()),
                ResponseFragment::Delta("are ".to_string()),
                ResponseFragment::Delta("the peacemakers.".to_string()),
                ResponseFragment::Done,
            ]
        );

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].preamble.as_deref(), Some("Be reverent."));
    }

    #[tokio::test]
    async fn failure_after_partial_output_ends_with_notice_and_sentinel() {
        let provider = Arc::new(
            ScriptedProvider::streaming(["Abiy Tsom lasts "]).then_error("connection reset"),
        );
        let client = client_with(provider);

        let mut stream = client.complete_stream(target(), &[], "How long is Abiy Tsom?");
        let fragments = drain(&mut stream).await;

        assert_eq!(
            fragments,
            vec![
                ResponseFragment::Delta("Abiy Tsom lasts ".to_string()),
                ResponseFragment::Delta(STREAM_ERROR_NOTICE.to_string()),
                ResponseFragment::Failed {
                    reason: "connection reset".to_string(),
                },
            ]
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn stream_closed_without_terminal_event_is_a_failure() {
        let provider = Arc::new(ScriptedProvider::streaming(["partial"]).then_close());
        let client = client_with(provider);

        let mut stream = client.complete_stream(target(), &[], "Tell me about Axum");
        let fragments = drain(&mut stream).await;

        assert_eq!(fragments.len(), 3);
        assert_eq!(
            fragments[1],
            ResponseFragment::Delta(STREAM_ERROR_NOTICE.to_string())
        );
        assert!(matches!(fragments[2], ResponseFragment::Failed { .. }));
    }

    #[tokio::test]
    async fn rejected_stream_start_still_delivers_notice() {
        let provider = Arc::new(ScriptedProvider::rejecting("quota exhausted"));
        let client = client_with(provider);

        let mut collected = String::new();
        let outcome = client
            .complete_stream_with(target(), &[], "Who was Saint Yared?", |text| {
                collected.push_str(text)
            })
            .await;

        assert_eq!(collected, STREAM_ERROR_NOTICE);
        assert!(matches!(outcome, ResponseOutcome::Failed { reason } if reason.contains("quota exhausted")));
    }

    #[tokio::test]
    async fn callback_form_reports_completion() {
        let provider = Arc::new(ScriptedProvider::streaming(["Ganna ", "is Christmas."]));
        let client = client_with(provider);

        let mut fragments = Vec::new();
        let outcome = client
            .complete_stream_with(target(), &[], "What is Ganna?", |text| {
                fragments.push(text.to_string())
            })
            .await;

        assert_eq!(outcome, ResponseOutcome::Completed);
        assert_eq!(fragments, vec!["Ganna ", "is Christmas."]);
    }

    #[tokio::test]
    async fn unconfigured_client_falls_back() {
        let client = CompletionClient::unconfigured("missing API key", CompletionSettings::new("m"));

        assert!(!client.is_configured());
        assert_eq!(client.complete(&[], "Hello").await, COMPLETION_FAILED_FALLBACK);

        let mut stream = client.complete_stream(target(), &[], "Hello");
        assert_eq!(
            drain(&mut stream).await,
            vec![
                ResponseFragment::Delta(STREAM_ERROR_NOTICE.to_string()),
                ResponseFragment::Failed {
                    reason: "missing API key".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn atomic_completion_substitutes_fallbacks() {
        let answered = client_with(Arc::new(ScriptedProvider::completing(
            "Meskel commemorates the finding of the True Cross.",
        )));
        assert_eq!(
            answered.complete(&[], "What is Meskel?").await,
            "Meskel commemorates the finding of the True Cross."
        );

        let empty = client_with(Arc::new(ScriptedProvider::completing("  ")));
        assert_eq!(
            empty.complete(&[], "What is Meskel?").await,
            EMPTY_COMPLETION_FALLBACK
        );

        let failing = client_with(Arc::new(ScriptedProvider::rejecting("503")));
        assert_eq!(
            failing.complete(&[], "What is Meskel?").await,
            COMPLETION_FAILED_FALLBACK
        );
    }
}
