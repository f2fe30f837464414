use futures::StreamExt;
use rig::completion::message::AssistantContent;
use rig::completion::{CompletionModel, CompletionRequestBuilder, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{gemini, openai};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use serde_json::{Map, Value, json};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use crate::events::{StreamEventMapped, StreamEventPayload, StreamTarget};
use crate::provider::{
    BoxFuture, ChatRequest, CompletionsFailedSnafu, EmptyMessageSetSnafu, HttpClientSnafu,
    LlmProvider, MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, Sampling, make_event_stream,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";
pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// Wire dialect spoken by the rig client behind the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigBackend {
    Gemini,
    OpenAi,
}

impl RigBackend {
    pub fn from_provider_id(provider_id: &str) -> Option<Self> {
        match provider_id.trim().to_ascii_lowercase().as_str() {
            "" | "gemini" | "google" => Some(Self::Gemini),
            "openai" | "rig-openai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn provider_id(self) -> &'static str {
        match self {
            Self::Gemini => GEMINI_PROVIDER_ID,
            Self::OpenAi => OPENAI_PROVIDER_ID,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Gemini => DEFAULT_GEMINI_MODEL,
            Self::OpenAi => DEFAULT_OPENAI_MODEL,
        }
    }

    /// Sampling fields the rig request builder has no setter for.
    fn sampling_params(self, sampling: &Sampling) -> Option<Value> {
        match self {
            // rig only writes temperature and max tokens into an existing
            // `generationConfig`, so the object is always sent.
            Self::Gemini => {
                let mut generation_config = Map::new();
                if let Some(top_p) = sampling.top_p {
                    generation_config.insert("topP".to_string(), json!(top_p));
                }
                if let Some(top_k) = sampling.top_k {
                    generation_config.insert("topK".to_string(), json!(top_k));
                }

                Some(json!({ "generationConfig": generation_config }))
            }
            // OpenAI has no top-k knob.
            Self::OpenAi => sampling.top_p.map(|top_p| json!({ "top_p": top_p })),
        }
    }
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
    backend: RigBackend,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig, backend: RigBackend) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config, backend })
    }

    fn build_gemini_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-gemini-client",
        })
    }

    fn build_openai_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-openai-client",
        })
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
        }
    }

    fn merged_preamble(request: &ChatRequest) -> Option<String> {
        let mut preamble_parts = Vec::new();

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            preamble_parts.push(preamble.clone());
        }

        // Rig exposes a single preamble field, so system-role messages are folded into it.
        for message in &request.messages {
            if matches!(message.role, Role::System) && !message.content.trim().is_empty() {
                preamble_parts.push(message.content.clone());
            }
        }

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    fn prepare_request<M>(
        model: &M,
        backend: RigBackend,
        request: &ChatRequest,
    ) -> ProviderResult<CompletionRequestBuilder<M>>
    where
        M: CompletionModel,
    {
        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                target = ?request.target,
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "prepare-request-pop-prompt",
                target: request.target,
            }
            .fail();
        };

        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        if let Some(temperature) = request.sampling.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.sampling.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        if let Some(params) = backend.sampling_params(&request.sampling) {
            builder = builder.additional_params(params);
        }

        Ok(builder)
    }

    async fn send_completion<M>(
        model: M,
        backend: RigBackend,
        request: ChatRequest,
    ) -> ProviderResult<String>
    where
        M: CompletionModel,
    {
        let builder = Self::prepare_request(&model, backend, &request)?;
        let response = builder.send().await.context(CompletionsFailedSnafu {
            stage: "send-completion",
        })?;

        Ok(collect_text(response.choice.iter()))
    }

    async fn open_stream<M>(
        model: &M,
        backend: RigBackend,
        request: &ChatRequest,
    ) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        let builder = Self::prepare_request(model, backend, request)?;
        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: ProviderError,
    ) {
        let _ = event_tx.send(StreamEventMapped::new(
            target,
            StreamEventPayload::Error(error.to_string()),
        ));
    }

    fn map_stream_item<R>(
        target: StreamTarget,
        item: StreamedAssistantContent<R>,
    ) -> Option<StreamEventMapped>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) if !text.text.is_empty() => Some(
                StreamEventMapped::new(target, StreamEventPayload::Delta(text.text)),
            ),
            // Tool calls, reasoning and usage frames never reach the transcript.
            _ => None,
        }
    }

    async fn run_stream_worker<M>(
        model: M,
        backend: RigBackend,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) where
        M: CompletionModel + 'static,
    {
        let target = request.target;
        let mut stream = match Self::open_stream(&model, backend, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    target = ?target,
                    provider_id = backend.provider_id(),
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, target, error);
                return;
            }
        };

        let mut released = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    released = true;
                    // The consumer is gone; stop provider IO.
                    tracing::debug!(target = ?target, "provider stream released by consumer");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(mapped) = Self::map_stream_item(target, item)
                                && event_tx.send(mapped).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !released && !stream_failed {
            let _ = event_tx.send(StreamEventMapped::new(target, StreamEventPayload::Done));
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.backend {
            RigBackend::Gemini => "Rig Gemini",
            RigBackend::OpenAi => "Rig OpenAI",
        }
    }

    fn default_model(&self) -> &str {
        self.backend.default_model()
    }

    fn complete<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            ensure!(
                !request.messages.is_empty(),
                EmptyMessageSetSnafu {
                    stage: "complete",
                    target: request.target,
                }
            );

            match self.backend {
                RigBackend::Gemini => {
                    let client = Self::build_gemini_client(&self.config)?;
                    let model = client.completion_model(request.model_id.clone());
                    Self::send_completion(model, self.backend, request).await
                }
                RigBackend::OpenAi => {
                    let client = Self::build_openai_client(&self.config)?;
                    let model = client.completion_model(request.model_id.clone());
                    Self::send_completion(model, self.backend, request).await
                }
            }
        })
    }

    fn stream_chat(&self, request: ChatRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: ProviderWorker = match self.backend {
            RigBackend::Gemini => {
                let client = Self::build_gemini_client(&self.config)?;
                let model = client.completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(
                    model,
                    self.backend,
                    request,
                    event_tx,
                    cancel_rx,
                ))
            }
            RigBackend::OpenAi => {
                let client = Self::build_openai_client(&self.config)?;
                let model = client.completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(
                    model,
                    self.backend,
                    request,
                    event_tx,
                    cancel_rx,
                ))
            }
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}

fn collect_text<'a>(contents: impl Iterator<Item = &'a AssistantContent>) -> String {
    contents
        .filter_map(|content| match content {
            AssistantContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect()
}
