use std::fmt;
use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

/// Identifier for one generation. Every send mints a new one so stale events
/// from an earlier stream can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationId(pub u64);

impl GenerationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "gen-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub generation: GenerationId,
    pub prompt: String,
    pub model_id: Option<String>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(generation: GenerationId, prompt: impl Into<String>) -> Self {
        Self {
            generation,
            prompt: prompt.into(),
            model_id: None,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Backend-agnostic stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventPayload {
    Delta(String),
    Done,
    /// Acknowledges a cancel signal; normal termination, not an error.
    Cancelled,
    Error(String),
    /// The backend could not serve the request at all.
    Unavailable(String),
}

impl StreamEventPayload {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Delta(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub generation: GenerationId,
    pub payload: StreamEventPayload,
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' has no endpoint configured"))]
    MissingEndpoint {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for {generation} has an empty prompt"))]
    EmptyPrompt {
        stage: &'static str,
        generation: GenerationId,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

/// Consumer side of one backend stream.
///
/// Dropping it signals cancellation to the worker.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Sends the cancel signal. Returns false if it was already sent or the
    /// worker is gone.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Producer side of one backend stream. `finish` consumes the emitter, so no
/// fragment can follow a terminal event.
pub struct StreamEmitter {
    generation: GenerationId,
    events: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEmitter {
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Returns false once the consumer has gone away.
    pub fn delta(&self, fragment: impl Into<String>) -> bool {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return !self.events.is_closed();
        }

        self.events
            .send(StreamEvent {
                generation: self.generation,
                payload: StreamEventPayload::Delta(fragment),
            })
            .is_ok()
    }

    pub fn finish(self, payload: StreamEventPayload) {
        debug_assert!(payload.is_terminal(), "finish requires a terminal payload");
        let _ = self.events.send(StreamEvent {
            generation: self.generation,
            payload,
        });
    }
}

pub trait ChatBackend: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Wires a fresh emitter/consumer pair plus the cancel signal the worker listens on.
pub fn make_event_stream(
    generation: GenerationId,
) -> (StreamEmitter, ProviderEventStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        StreamEmitter {
            generation,
            events: event_tx,
        },
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
