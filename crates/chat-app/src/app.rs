use std::sync::Arc;

use murmur_chat::{ChatSession, SessionError};
use murmur_llm::{ChatBackend, ScriptedBackend, create_backend};
use murmur_storage::{InMemoryStorage, MessageStore, SqliteStorage, StorageError};
use snafu::{ResultExt, Snafu};

use crate::cli::Cli;
use crate::repl::Repl;
use crate::settings::{Settings, SettingsStore};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open message history at {location} on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        location: String,
        source: StorageError,
    },
    #[snafu(display("chat session ended unexpectedly on `{stage}`: {source}"))]
    Session {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl AppError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::OpenStorage { stage, .. }
            | Self::Session { stage, .. }
            | Self::ReadInput { stage, .. }
            | Self::WriteOutput { stage, .. } => stage,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub async fn run(cli: Cli) -> AppResult<()> {
    let settings = resolve_settings(&cli);
    let store = open_store(&settings, cli.ephemeral).await?;
    let backend = build_backend(&settings);

    let session = ChatSession::spawn(
        store,
        backend.clone(),
        settings.session_config().without_initial_load(),
    );
    session.load_history().await.context(SessionSnafu {
        stage: "initial-load-history",
    })?;

    let outcome = Repl::new(session.clone(), backend.name()).run().await;
    let shutdown = session
        .shutdown()
        .await
        .context(SessionSnafu { stage: "shutdown" });
    outcome.and(shutdown)
}

fn resolve_settings(cli: &Cli) -> Settings {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(SettingsStore::default_config_path);
    let mut settings = SettingsStore::new(config_path).load_or_default();

    if let Some(provider_id) = &cli.provider {
        settings.provider_id = provider_id.clone();
    }
    if let Some(model) = &cli.model {
        settings.model = model.clone();
    }
    if let Some(database) = &cli.database {
        settings.database_path = Some(database.clone());
    }

    settings.normalized()
}

async fn open_store(settings: &Settings, ephemeral: bool) -> AppResult<Arc<dyn MessageStore>> {
    if ephemeral {
        tracing::info!("history is kept in memory only");
        return Ok(Arc::new(InMemoryStorage::new()));
    }

    let location = settings.database_location().to_string_lossy().into_owned();
    let store = SqliteStorage::open(&location)
        .await
        .context(OpenStorageSnafu {
            stage: "open-message-store",
            location: location.clone(),
        })?;
    tracing::info!(database_url = store.database_url(), "message history opened");
    Ok(Arc::new(store))
}

/// A backend that cannot be built still yields a working session: every send
/// reports the configuration problem as an unavailable backend.
fn build_backend(settings: &Settings) -> Arc<dyn ChatBackend> {
    match create_backend(settings.backend_config()) {
        Ok(backend) => {
            tracing::info!(backend = backend.id(), "backend ready");
            backend
        }
        Err(error) => {
            tracing::warn!(provider = %settings.provider_id, "backend not configured: {error}");
            Arc::new(ScriptedBackend::unavailable(format!(
                "{error}. Check the provider settings"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_llm::{GenerationId, StreamEventPayload, StreamRequest};

    use super::*;

    #[tokio::test]
    async fn ephemeral_store_ignores_the_database_path() {
        let settings = Settings {
            database_path: Some("/definitely/not/writable/history.sqlite3".into()),
            ..Settings::default()
        };
        let store = open_store(&settings, true).await.expect("memory store");
        assert!(
            store
                .fetch_all_ordered_by_time()
                .await
                .expect("fetch")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn unopenable_database_is_fatal() {
        let directory = tempfile::tempdir().expect("tempdir");
        let blocker = directory.path().join("not-a-directory");
        std::fs::write(&blocker, "x").expect("write blocker");
        let settings = Settings {
            database_path: Some(blocker.join("history.sqlite3")),
            ..Settings::default()
        };

        let error = open_store(&settings, false)
            .await
            .err()
            .expect("open must fail");
        assert!(matches!(error, AppError::OpenStorage { .. }));
        assert_eq!(error.stage(), "open-message-store");
    }

    #[tokio::test]
    async fn sqlite_store_is_created_at_the_configured_path() {
        let directory = tempfile::tempdir().expect("tempdir");
        let path = directory.path().join("nested").join("history.sqlite3");
        let settings = Settings {
            database_path: Some(path.clone()),
            ..Settings::default()
        };

        open_store(&settings, false).await.expect("sqlite store");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn misconfigured_backend_reports_unavailable() {
        let settings = Settings {
            provider_id: "carrier-pigeon".to_string(),
            ..Settings::default()
        };
        let backend = build_backend(&settings);

        let handle = backend
            .stream_chat(StreamRequest::new(GenerationId::new(1), "Hi"))
            .expect("stream");
        let mut stream = handle.stream;
        tokio::spawn(handle.worker);

        match stream.recv().await.map(|event| event.payload) {
            Some(StreamEventPayload::Unavailable(message)) => {
                assert!(message.contains("carrier-pigeon"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
