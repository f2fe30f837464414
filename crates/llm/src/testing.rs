//! In-process provider with scripted responses, for tests that must not touch the network.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::events::{StreamEventMapped, StreamEventPayload};
use crate::provider::{
    BoxFuture, ChatRequest, LlmProvider, ProviderError, ProviderResult, ProviderStreamHandle,
    ProviderWorker, make_event_stream,
};

enum Script {
    Steps(Vec<StreamEventPayload>),
    Manual(Mutex<Option<mpsc::UnboundedReceiver<StreamEventPayload>>>),
    Rejecting(String),
}

pub struct ScriptedProvider {
    script: Script,
    completion: Option<String>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            completion: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Streams `fragments` in order, then `Done`.
    pub fn streaming<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut steps = fragments
            .into_iter()
            .map(|fragment| StreamEventPayload::Delta(fragment.into()))
            .collect::<Vec<_>>();
        steps.push(StreamEventPayload::Done);
        Self::with_script(Script::Steps(steps))
    }

    /// Answers atomic completions with `text`; streams it as a single fragment.
    pub fn completing(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut provider = Self::streaming([text.clone()]);
        provider.completion = Some(text);
        provider
    }

    /// Fails every call before any output.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self::with_script(Script::Rejecting(reason.into()))
    }

    /// Fragments are pushed by the test through the returned feed, one at a time.
    pub fn manual() -> (Self, ScriptFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self::with_script(Script::Manual(Mutex::new(Some(rx)))),
            ScriptFeed { tx },
        )
    }

    /// Replaces the trailing `Done` with a provider error.
    pub fn then_error(self, reason: impl Into<String>) -> Self {
        self.replace_terminal(Some(StreamEventPayload::Error(reason.into())))
    }

    /// Drops the trailing `Done`, so the channel closes without a terminal event.
    pub fn then_close(self) -> Self {
        self.replace_terminal(None)
    }

    fn replace_terminal(mut self, terminal: Option<StreamEventPayload>) -> Self {
        if let Script::Steps(steps) = &mut self.script {
            if matches!(steps.last(), Some(StreamEventPayload::Done)) {
                steps.pop();
            }
            steps.extend(terminal);
        }
        self
    }

    /// Every request received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn record(&self, request: &ChatRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
    }

    fn rejection(reason: &str) -> ProviderError {
        ProviderError::StreamFailed {
            stage: "scripted-provider",
            message: reason.to_string(),
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "scripted-model"
    }

    fn complete<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ProviderResult<String>> {
        self.record(&request);
        Box::pin(async move {
            match &self.script {
                Script::Rejecting(reason) => Err(Self::rejection(reason)),
                Script::Steps(steps) => Ok(self.completion.clone().unwrap_or_else(|| {
                    steps
                        .iter()
                        .filter_map(|step| match step {
                            StreamEventPayload::Delta(text) => Some(text.as_str()),
                            StreamEventPayload::Done | StreamEventPayload::Error(_) => None,
                        })
                        .collect()
                })),
                Script::Manual(_) => Err(Self::rejection("manual script only streams")),
            }
        })
    }

    fn stream_chat(&self, request: ChatRequest) -> ProviderResult<ProviderStreamHandle> {
        self.record(&request);
        let target = request.target;
        let (event_tx, stream, _cancel_rx) = make_event_stream(target);

        let worker: ProviderWorker = match &self.script {
            Script::Rejecting(reason) => return Err(Self::rejection(reason)),
            Script::Steps(steps) => {
                let steps = steps.clone();
                Box::pin(async move {
                    for payload in steps {
                        // Suspend between fragments like a network read would.
                        tokio::task::yield_now().await;
                        if event_tx
                            .send(StreamEventMapped::new(target, payload))
                            .is_err()
                        {
                            return;
                        }
                    }
                })
            }
            Script::Manual(feed) => {
                let Some(mut feed_rx) = feed.lock().ok().and_then(|mut slot| slot.take()) else {
                    return Err(Self::rejection("manual script already consumed"));
                };
                Box::pin(async move {
                    while let Some(payload) = feed_rx.recv().await {
                        let event = StreamEventMapped::new(target, payload);
                        let terminal = event.is_terminal();
                        if event_tx.send(event).is_err() || terminal {
                            return;
                        }
                    }
                })
            }
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}

/// Test-side handle driving a [`ScriptedProvider::manual`] stream.
pub struct ScriptFeed {
    tx: mpsc::UnboundedSender<StreamEventPayload>,
}

impl ScriptFeed {
    pub fn delta(&self, text: impl Into<String>) {
        let _ = self.tx.send(StreamEventPayload::Delta(text.into()));
    }

    pub fn done(&self) {
        let _ = self.tx.send(StreamEventPayload::Done);
    }
}
