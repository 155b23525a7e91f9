use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use super::provider::{
    ChatBackend, ProviderResult, ProviderStreamHandle, ProviderWorker, StreamEmitter,
    StreamEventPayload, StreamRequest, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";
pub const DEFAULT_SCRIPTED_REPLY: &str =
    "Hi, I am the offline responder. Configure a provider to talk to a real model.";
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_FRAGMENT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEnding {
    Complete,
    Fail(String),
}

/// Replays a fixed reply regardless of the prompt. Useful offline and in tests.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    fragments: Vec<String>,
    initial_delay: Duration,
    fragment_delay: Duration,
    ending: ScriptEnding,
    unavailable: Option<String>,
}

impl ScriptedBackend {
    /// One fragment per character of `reply`.
    pub fn from_reply(reply: &str) -> Self {
        Self::from_fragments(reply.chars().map(String::from))
    }

    pub fn from_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            initial_delay: Duration::ZERO,
            fragment_delay: Duration::ZERO,
            ending: ScriptEnding::Complete,
            unavailable: None,
        }
    }

    /// Every stream terminates immediately with `Unavailable(reason)`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            unavailable: Some(reason.into()),
            ..Self::from_fragments(Vec::<String>::new())
        }
    }

    pub fn with_delays(mut self, initial_delay: Duration, fragment_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.fragment_delay = fragment_delay;
        self
    }

    /// After the last fragment, terminate with `Error(message)` instead of `Done`.
    pub fn failing_with(mut self, message: impl Into<String>) -> Self {
        self.ending = ScriptEnding::Fail(message.into());
        self
    }

    async fn pause(delay: Duration, cancel_rx: &mut oneshot::Receiver<()>) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty));
        }

        tokio::select! {
            _ = cancel_rx => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn run_stream_worker(
        script: ScriptedBackend,
        emitter: StreamEmitter,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let generation = emitter.generation();
        if let Some(reason) = script.unavailable {
            emitter.finish(StreamEventPayload::Unavailable(reason));
            return;
        }

        if Self::pause(script.initial_delay, &mut cancel_rx).await {
            emitter.finish(StreamEventPayload::Cancelled);
            return;
        }

        for (index, fragment) in script.fragments.into_iter().enumerate() {
            if index > 0 && Self::pause(script.fragment_delay, &mut cancel_rx).await {
                tracing::debug!(generation = %generation, emitted = index, "scripted stream cancelled");
                emitter.finish(StreamEventPayload::Cancelled);
                return;
            }

            if !emitter.delta(fragment) {
                return;
            }
        }

        match script.ending {
            ScriptEnding::Complete => emitter.finish(StreamEventPayload::Done),
            ScriptEnding::Fail(message) => emitter.finish(StreamEventPayload::Error(message)),
        }
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::from_reply(DEFAULT_SCRIPTED_REPLY)
            .with_delays(DEFAULT_INITIAL_DELAY, DEFAULT_FRAGMENT_DELAY)
    }
}

impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        let (emitter, stream, cancel_rx) = make_event_stream(request.generation);
        let worker: ProviderWorker =
            Box::pin(Self::run_stream_worker(self.clone(), emitter, cancel_rx));

        Ok(ProviderStreamHandle { stream, worker })
    }
}
