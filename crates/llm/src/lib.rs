use std::sync::Arc;

mod client;
mod events;
mod provider;
mod rig_adapter;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{
    COMPLETION_FAILED_FALLBACK, CompletionClient, CompletionSettings, EMPTY_COMPLETION_FALLBACK,
    FallbackNotices, ResponseFragment, ResponseOutcome, ResponseStream, STREAM_ERROR_NOTICE,
};
pub use events::{StreamEventMapped, StreamEventPayload, StreamTarget};
pub use provider::{
    BoxFuture, ChatRequest, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream,
    ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role, Sampling,
    make_event_stream,
};
pub use rig_adapter::{
    DEFAULT_GEMINI_MODEL, DEFAULT_OPENAI_MODEL, GEMINI_PROVIDER_ID, OPENAI_PROVIDER_ID,
    RigBackend, RigProviderAdapter,
};

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    let Some(backend) = RigBackend::from_provider_id(&config.provider_id) else {
        return Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        });
    };

    config.provider_id = backend.provider_id().to_string();
    Ok(Arc::new(RigProviderAdapter::new(config, backend)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_provider_normalizes_backend_ids() {
        let provider = create_provider(ProviderConfig::new("", "key", ""))
            .expect("blank id selects the default backend");
        assert_eq!(provider.id(), GEMINI_PROVIDER_ID);
        assert_eq!(provider.default_model(), DEFAULT_GEMINI_MODEL);

        let provider = create_provider(ProviderConfig::new("rig-openai", "key", ""))
            .expect("openai alias is supported");
        assert_eq!(provider.id(), OPENAI_PROVIDER_ID);
        assert_eq!(provider.name(), "Rig OpenAI");
    }

    #[test]
    fn create_provider_rejects_unknown_ids() {
        let error = create_provider(ProviderConfig::new("ollama", "key", ""))
            .err()
            .expect("unknown provider must be rejected");

        assert!(
            matches!(error, ProviderError::UnsupportedProvider { ref provider_id, .. } if provider_id == "ollama")
        );
    }
}
