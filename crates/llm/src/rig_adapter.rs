use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{ResultExt, ensure};
use tokio::sync::oneshot;

use super::provider::{
    ChatBackend, CompletionsFailedSnafu, EmptyPromptSnafu, HttpClientSnafu, MissingApiKeySnafu,
    ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEmitter,
    StreamEventPayload, StreamRequest, make_event_stream,
};
use super::BackendConfig;

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

/// Streams completions from an OpenAI-compatible endpoint through Rig.
pub struct RigProviderAdapter {
    config: BackendConfig,
}

impl RigProviderAdapter {
    pub fn new(config: BackendConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &BackendConfig) -> ProviderResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn model_id(config: &BackendConfig, request: &StreamRequest) -> String {
        request
            .model_id
            .clone()
            .or_else(|| config.model_id.clone())
            .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string())
    }

    async fn open_stream(
        config: &BackendConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(Self::model_id(config, request));

        let mut builder = model.completion_request(RigMessage::user(request.prompt.clone()));

        if let Some(preamble) = &request.preamble
            && !preamble.trim().is_empty()
        {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<String>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(text.text),
            // Reasoning, tool traffic and the final usage record are not part of the answer text.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: BackendConfig,
        request: StreamRequest,
        emitter: StreamEmitter,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let generation = request.generation;
        let mut stream = tokio::select! {
            _ = &mut cancel_rx => {
                emitter.finish(StreamEventPayload::Cancelled);
                return;
            }
            opened = Self::open_stream(&config, &request) => match opened {
                Ok(stream) => stream,
                Err(error) => {
                    tracing::error!(
                        generation = %generation,
                        provider_id = %config.provider_id,
                        error = %error,
                        "failed to open provider stream"
                    );
                    emitter.finish(StreamEventPayload::Unavailable(error.to_string()));
                    return;
                }
            },
        };

        let mut fragments = 0_usize;
        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(generation = %generation, fragments, "provider stream cancelled");
                    stream.cancel();
                    emitter.finish(StreamEventPayload::Cancelled);
                    return;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(fragment) = Self::map_stream_item(item) {
                                fragments += 1;
                                if !emitter.delta(fragment) {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            tracing::warn!(
                                generation = %generation,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            emitter.finish(StreamEventPayload::Error(error.to_string()));
                            return;
                        }
                        None => break,
                    }
                }
            }
        }

        tracing::debug!(generation = %generation, fragments, "provider stream completed");
        emitter.finish(StreamEventPayload::Done);
    }
}

impl ChatBackend for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig OpenAI"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "stream-chat",
                generation: request.generation,
            }
        );

        let (emitter, stream, cancel_rx) = make_event_stream(request.generation);
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            emitter,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_requires_api_key() {
        let config = BackendConfig::new(RIG_OPENAI_PROVIDER_ID, "", "");
        let error = RigProviderAdapter::new(config)
            .err()
            .expect("missing key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn request_model_overrides_configured_model() {
        let config = BackendConfig::new(RIG_OPENAI_PROVIDER_ID, "sk-test", "")
            .with_model("gpt-4o");
        let request = StreamRequest::new(crate::GenerationId::new(1), "hi");
        assert_eq!(RigProviderAdapter::model_id(&config, &request), "gpt-4o");

        let request = request.with_model("o3");
        assert_eq!(RigProviderAdapter::model_id(&config, &request), "o3");
    }
}
