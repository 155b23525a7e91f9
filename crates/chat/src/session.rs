use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use murmur_llm::{
    ChatBackend, GenerationId, ProviderEventStream, StreamEvent, StreamEventPayload, StreamRequest,
};
use murmur_storage::{
    MessageId, MessageRecord, MessageStatus, MessageStore, StorageError, Timestamp,
};
use snafu::{OptionExt, Snafu};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::events::{Command, Notice, StorageOperation};
use crate::message::{
    Conversation, ConversationSnapshot, MessageClock, TrailingHandle, assistant_placeholder,
    user_message,
};
use crate::state::{GenerationState, GenerationTransition};

/// How long an implicit stop waits for the backend to acknowledge cancellation
/// before the worker is aborted.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const NOTICE_CAPACITY: usize = 64;
const ENDED_WITHOUT_TERMINAL: &str = "backend stream ended before a terminal event";

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("chat session closed before `{stage}` completed"))]
    Closed { stage: &'static str },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Per-request options forwarded to the backend plus orchestration knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model_id: Option<String>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub drain_timeout: Duration,
    pub load_history_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            preamble: None,
            temperature: None,
            max_tokens: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            load_history_on_start: true,
        }
    }
}

impl SessionConfig {
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

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn without_initial_load(mut self) -> Self {
        self.load_history_on_start = false;
        self
    }

    fn request(&self, generation: GenerationId, prompt: String) -> StreamRequest {
        let mut request = StreamRequest::new(generation, prompt);
        if let Some(model_id) = &self.model_id {
            request = request.with_model(model_id.clone());
        }
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble.clone());
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// Handle to one conversation's orchestrator task.
///
/// Clones share the same task. Command methods resolve once the command has
/// been applied; a running generation keeps streaming afterwards and is
/// observed through [`ChatSession::subscribe`] or awaited with
/// [`ChatSession::wait_idle`].
#[derive(Clone)]
pub struct ChatSession {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ConversationSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl ChatSession {
    /// Starts the orchestrator on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn MessageStore>,
        backend: Arc<dyn ChatBackend>,
        config: SessionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConversationSnapshot::default());
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        if config.load_history_on_start {
            let (ack, _) = oneshot::channel();
            let _ = command_tx.send(Command::LoadHistory { ack });
        }

        let actor = SessionActor {
            store,
            backend,
            config,
            conversation: Conversation::new(),
            clock: MessageClock::new(),
            state: GenerationState::Idle,
            next_generation: GenerationId::new(1),
            active: None,
            snapshots: snapshot_tx,
            notices: notice_tx.clone(),
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            snapshots: snapshot_rx,
            notices: notice_tx,
        }
    }

    pub async fn send(&self, text: impl Into<String>) -> SessionResult<()> {
        let text = text.into();
        self.request("send", |ack| Command::Send { text, ack }).await
    }

    /// Signals cancellation of the running generation. Has no effect while idle.
    pub async fn stop(&self) -> SessionResult<()> {
        self.request("stop", |ack| Command::Stop { ack }).await
    }

    pub async fn clear_history(&self) -> SessionResult<()> {
        self.request("clear-history", |ack| Command::ClearHistory { ack })
            .await
    }

    /// Removes every message with `timestamp >= from` from memory and the store.
    pub async fn delete_from(&self, from: Timestamp) -> SessionResult<()> {
        self.request("delete-from", |ack| Command::DeleteFrom { from, ack })
            .await
    }

    pub async fn load_history(&self) -> SessionResult<()> {
        self.request("load-history", |ack| Command::LoadHistory { ack })
            .await
    }

    /// Stops any running generation, persists it, and ends the task.
    pub async fn shutdown(&self) -> SessionResult<()> {
        self.request("shutdown", |ack| Command::Shutdown { ack }).await
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn wait_idle(&self) -> SessionResult<()> {
        let mut snapshots = self.snapshots.clone();
        snapshots
            .wait_for(|snapshot| !snapshot.generating)
            .await
            .map(|_| ())
            .ok()
            .context(ClosedSnafu { stage: "wait-idle" })
    }

    async fn request(
        &self,
        stage: &'static str,
        build: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> SessionResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(build(ack_tx))
            .ok()
            .context(ClosedSnafu { stage })?;
        ack_rx.await.ok().context(ClosedSnafu { stage })
    }
}

struct ActiveGeneration {
    generation: GenerationId,
    assistant: TrailingHandle,
    stream: ProviderEventStream,
    worker: JoinHandle<()>,
    fragments: usize,
}

enum Input {
    Command(Option<Command>),
    Stream(Option<StreamEvent>),
}

/// Sole owner of the conversation, the generation state, and the store handle.
struct SessionActor {
    store: Arc<dyn MessageStore>,
    backend: Arc<dyn ChatBackend>,
    config: SessionConfig,
    conversation: Conversation,
    clock: MessageClock,
    state: GenerationState,
    next_generation: GenerationId,
    active: Option<ActiveGeneration>,
    snapshots: watch::Sender<ConversationSnapshot>,
    notices: broadcast::Sender<Notice>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(backend = self.backend.id(), "chat session started");

        loop {
            let input = match self.active.as_mut() {
                Some(active) => tokio::select! {
                    command = commands.recv() => Input::Command(command),
                    event = active.stream.recv() => Input::Stream(event),
                },
                None => Input::Command(commands.recv().await),
            };

            match input {
                Input::Command(Some(command)) => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Input::Command(None) => {
                    tracing::debug!("all session handles dropped");
                    self.stop_and_drain().await;
                    break;
                }
                Input::Stream(Some(event)) => self.handle_stream_event(event).await,
                Input::Stream(None) => self.handle_stream_closed().await,
            }
        }

        tracing::debug!("chat session stopped");
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        tracing::trace!(command = command.name(), "handling session command");

        match command {
            Command::Send { text, ack } => {
                self.send(text).await;
                let _ = ack.send(());
            }
            Command::Stop { ack } => {
                self.request_stop();
                let _ = ack.send(());
            }
            Command::ClearHistory { ack } => {
                self.clear_history().await;
                let _ = ack.send(());
            }
            Command::DeleteFrom { from, ack } => {
                self.delete_from(from).await;
                let _ = ack.send(());
            }
            Command::LoadHistory { ack } => {
                self.load_history().await;
                let _ = ack.send(());
            }
            Command::Shutdown { ack } => {
                self.stop_and_drain().await;
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    async fn send(&mut self, text: String) {
        if text.trim().is_empty() {
            tracing::debug!("ignoring blank prompt");
            return;
        }

        if self.active.is_some() {
            tracing::info!("prompt submitted while generating, stopping the running generation");
            self.stop_and_drain().await;
        }

        let user = user_message(self.clock.next(), &text);
        self.conversation.push(user.clone());
        self.publish();
        self.persist(user).await;

        let generation = self.next_generation;
        self.next_generation = generation.next();
        match self.state.apply(GenerationTransition::Start(generation)) {
            Ok(state) => self.state = state,
            Err(rejection) => {
                tracing::error!(%generation, ?rejection, "generation could not start");
                return;
            }
        }

        let assistant = self
            .conversation
            .push(assistant_placeholder(self.clock.next()));
        self.publish();

        let request = self.config.request(generation, text);
        match self.backend.stream_chat(request) {
            Ok(handle) => {
                let worker = tokio::spawn(handle.worker);
                tracing::debug!(%generation, backend = self.backend.id(), "generation started");
                self.active = Some(ActiveGeneration {
                    generation,
                    assistant,
                    stream: handle.stream,
                    worker,
                    fragments: 0,
                });
            }
            Err(error) => {
                tracing::warn!(%generation, error = %error, "backend refused the stream");
                self.abandon_generation(generation, assistant, error.to_string());
            }
        }
    }

    /// Signals cancel to the running stream. Returns false when idle.
    fn request_stop(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            tracing::trace!("stop ignored while idle");
            return false;
        };

        if active.stream.cancel_requested() {
            return true;
        }

        let generation = active.generation;
        let delivered = active.stream.cancel();
        tracing::debug!(%generation, delivered, "cancel signalled");

        match self
            .state
            .apply(GenerationTransition::RequestCancel(generation))
        {
            Ok(state) => self.state = state,
            Err(rejection) => tracing::warn!(%generation, ?rejection, "cancel transition rejected"),
        }
        true
    }

    /// Cancels the running generation and consumes its remaining events so the
    /// fragments already in flight end up in the persisted message.
    async fn stop_and_drain(&mut self) {
        if !self.request_stop() {
            return;
        }

        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            let Some(active) = self.active.as_mut() else {
                break;
            };

            match tokio::time::timeout_at(deadline, active.stream.recv()).await {
                Ok(Some(event)) => self.handle_stream_event(event).await,
                Ok(None) => self.handle_stream_closed().await,
                Err(_) => {
                    if let Some(active) = self.active.as_ref() {
                        tracing::warn!(
                            generation = %active.generation,
                            "backend did not acknowledge cancel in time, aborting worker"
                        );
                        active.worker.abort();
                    }
                    self.finish_generation(MessageStatus::Committed, None)
                        .await;
                }
            }
        }
    }

    async fn handle_stream_event(&mut self, event: StreamEvent) {
        if !self.state.accepts_stream_event(event.generation) {
            tracing::debug!(generation = %event.generation, "dropping stale stream event");
            return;
        }

        let Some(active) = self.active.as_mut() else {
            return;
        };

        match event.payload {
            StreamEventPayload::Delta(fragment) => {
                let appended = self.conversation.append_text(&active.assistant, &fragment);
                if appended {
                    active.fragments += 1;
                    self.publish();
                } else {
                    tracing::error!(
                        generation = %active.generation,
                        "assistant message no longer resolves, fragment dropped"
                    );
                }
            }
            StreamEventPayload::Done | StreamEventPayload::Cancelled => {
                self.finish_generation(MessageStatus::Committed, None)
                    .await;
            }
            StreamEventPayload::Error(message) => {
                self.finish_generation(MessageStatus::Failed, Some(message))
                    .await;
            }
            StreamEventPayload::Unavailable(message) => {
                if active.fragments > 0 {
                    self.finish_generation(MessageStatus::Failed, Some(message))
                        .await;
                } else if let Some(active) = self.active.take() {
                    active.worker.abort();
                    self.abandon_generation(active.generation, active.assistant, message);
                }
            }
        }
    }

    async fn handle_stream_closed(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };

        if active.stream.cancel_requested() {
            self.finish_generation(MessageStatus::Committed, None)
                .await;
        } else {
            self.finish_generation(
                MessageStatus::Failed,
                Some(ENDED_WITHOUT_TERMINAL.to_string()),
            )
            .await;
        }
    }

    /// Seals the assistant message with `status`, persists it once, and
    /// returns to idle.
    async fn finish_generation(&mut self, status: MessageStatus, failure: Option<String>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveGeneration {
            generation,
            assistant,
            stream,
            fragments,
            ..
        } = active;
        drop(stream);

        let sealed = self.conversation.get_mut(&assistant).map(|message| {
            message.status = status;
            message.clone()
        });
        tracing::info!(%generation, fragments, ?status, "generation finished");

        match sealed {
            Some(record) => self.persist(record).await,
            None => tracing::error!(%generation, "assistant message vanished before persist"),
        }

        self.finish_state(generation);
        self.publish();

        if let Some(message) = failure {
            tracing::warn!(%generation, error = %message, "stream failed");
            self.notify(Notice::StreamFailed {
                generation,
                message,
            });
        }
    }

    /// Drops the empty placeholder of a generation the backend could not serve.
    fn abandon_generation(
        &mut self,
        generation: GenerationId,
        assistant: TrailingHandle,
        message: String,
    ) {
        if self.conversation.remove_trailing(&assistant).is_none() {
            tracing::error!(%generation, "placeholder was not the trailing message");
        }
        self.finish_state(generation);
        self.publish();
        tracing::warn!(%generation, error = %message, "backend unavailable");
        self.notify(Notice::BackendUnavailable {
            generation,
            message,
        });
    }

    async fn clear_history(&mut self) {
        self.stop_and_drain().await;

        match self.store.delete_all().await {
            Ok(removed) => {
                tracing::info!(removed, "history cleared");
                self.conversation.clear();
                self.publish();
            }
            Err(error) => self.storage_failed(StorageOperation::DeleteAll, error),
        }
    }

    async fn delete_from(&mut self, from: Timestamp) {
        let covers_generation = match self.active.as_ref() {
            Some(active) => self
                .conversation
                .get(&active.assistant)
                .is_none_or(|message| message.timestamp >= from),
            None => false,
        };
        if covers_generation {
            self.stop_and_drain().await;
        }

        match self.store.delete_from(from).await {
            Ok(removed_rows) => {
                let removed = self.conversation.truncate_from(from);
                tracing::info!(%from, removed, removed_rows, "history truncated");
                self.publish();
            }
            Err(error) => self.storage_failed(StorageOperation::DeleteFrom, error),
        }
    }

    async fn load_history(&mut self) {
        if let Some(active) = self.active.as_ref() {
            let reason = format!("{} is still generating", active.generation);
            tracing::warn!(%reason, "load-history rejected");
            self.notify(Notice::Rejected {
                command: "load-history",
                reason,
            });
            return;
        }

        match self.store.fetch_all_ordered_by_time().await {
            Ok(messages) => {
                let count = messages.len();
                self.conversation.replace(messages);
                if let Some(newest) = self.conversation.newest_timestamp() {
                    self.clock.observe(newest);
                }
                tracing::info!(count, "history loaded");
                self.publish();
            }
            Err(error) => self.storage_failed(StorageOperation::Fetch, error),
        }
    }

    async fn persist(&mut self, record: MessageRecord) {
        let message_id = record.id;
        if let Err(error) = self.store.append(record).await {
            self.record_storage_failure(StorageOperation::Append, Some(message_id), error);
        }
    }

    fn finish_state(&mut self, generation: GenerationId) {
        match self.state.apply(GenerationTransition::Finish(generation)) {
            Ok(state) => self.state = state,
            Err(rejection) => {
                tracing::warn!(%generation, ?rejection, "finish transition rejected");
                self.state = GenerationState::Idle;
            }
        }
    }

    fn storage_failed(&self, operation: StorageOperation, error: StorageError) {
        self.record_storage_failure(operation, None, error);
    }

    fn record_storage_failure(
        &self,
        operation: StorageOperation,
        message_id: Option<MessageId>,
        error: StorageError,
    ) {
        tracing::error!(
            operation = operation.as_str(),
            message_id = message_id.map(tracing::field::display),
            stage = error.stage(),
            error = %error,
            "storage operation failed"
        );
        self.notify(Notice::StorageFailed {
            operation,
            message: error.to_string(),
        });
    }

    fn publish(&self) {
        self.snapshots
            .send_replace(self.conversation.snapshot(self.state.is_generating()));
    }

    fn notify(&self, notice: Notice) {
        if self.notices.send(notice).is_err() {
            tracing::trace!("no notice subscribers");
        }
    }
}
