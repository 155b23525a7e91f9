use std::sync::Arc;

mod http;
mod provider;
mod rig_adapter;
mod scripted;

pub use http::{DEFAULT_HTTP_ENDPOINT, DEFAULT_MAX_TOKENS, HTTP_PROVIDER_ID, HttpTextBackend};
pub use provider::{
    ChatBackend, GenerationId, ProviderError, ProviderEventStream, ProviderResult,
    ProviderStreamHandle, ProviderWorker, StreamEmitter, StreamEvent, StreamEventPayload,
    StreamRequest, make_event_stream,
};
pub use rig_adapter::{DEFAULT_OPENAI_MODEL, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use scripted::{
    DEFAULT_FRAGMENT_DELAY, DEFAULT_INITIAL_DELAY, DEFAULT_SCRIPTED_REPLY, SCRIPTED_PROVIDER_ID,
    ScriptEnding, ScriptedBackend,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
    pub model_id: Option<String>,
    pub max_tokens: Option<u64>,
    pub scripted_reply: Option<String>,
}

impl BackendConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            model_id: None,
            max_tokens: None,
            scripted_reply: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into().trim().to_string();
        self.model_id = (!model_id.is_empty()).then_some(model_id);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_scripted_reply(mut self, reply: impl Into<String>) -> Self {
        self.scripted_reply = Some(reply.into());
        self
    }
}

pub fn create_backend(mut config: BackendConfig) -> ProviderResult<Arc<dyn ChatBackend>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)?))
        }
        HTTP_PROVIDER_ID => {
            if config.endpoint.is_empty() {
                config.endpoint = DEFAULT_HTTP_ENDPOINT.to_string();
            }
            Ok(Arc::new(HttpTextBackend::new(config)?))
        }
        SCRIPTED_PROVIDER_ID => {
            let backend = match config.scripted_reply.as_deref() {
                Some(reply) if !reply.is_empty() => ScriptedBackend::from_reply(reply)
                    .with_delays(DEFAULT_INITIAL_DELAY, DEFAULT_FRAGMENT_DELAY),
                _ => ScriptedBackend::default(),
            };
            Ok(Arc::new(backend))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-backend",
            provider_id: config.provider_id,
        }),
    }
}
