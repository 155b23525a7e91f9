use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::ids::MessageId;
use super::types::{
    MessageContent, MessageRecord, MessageStatus, Sender, Timestamp, validate_image_reference,
};
use super::{BoxFuture, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // One pinned connection: writes are serialized by the pool itself and an
        // in-memory database lives exactly as long as the store.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // Explicit PRAGMA writes make bootstrap behavior deterministic.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite message store ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

impl MessageStore for SqliteStorage {
    fn append(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            validate_image_reference(&message.content, "message-append-validate")?;

            let (content_kind, content_text, content_image_reference) =
                content_to_sql(&message.content);

            let inserted = sqlx::query(
                "INSERT INTO messages (id, timestamp, sender, content_kind, content_text, content_image_reference, status) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id.to_string())
            .bind(message.timestamp.as_micros())
            .bind(sender_to_sql(message.sender))
            .bind(content_kind)
            .bind(content_text)
            .bind(content_image_reference)
            .bind(status_to_sql(message.status))
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(database_error))
                    if database_error.is_unique_violation() =>
                {
                    ConflictSnafu {
                        stage: "message-append-duplicate",
                        entity: "message",
                        details: format!("message '{}' was already persisted", message.id),
                    }
                    .fail()
                }
                Err(source) => Err(StorageError::SqliteQuery {
                    stage: "message-append-insert",
                    source,
                }),
            }
        })
    }

    fn fetch_all_ordered_by_time(&self) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, timestamp, sender, content_kind, content_text, content_image_reference, status FROM messages ORDER BY timestamp ASC, id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-fetch-all-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM messages")
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-all",
                })?;

            Ok(result.rows_affected())
        })
    }

    fn delete_from(&self, from: Timestamp) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            // A single statement is atomic: readers see all or none of the range gone.
            let result = sqlx::query("DELETE FROM messages WHERE timestamp >= ?")
                .bind(from.as_micros())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-from",
                })?;

            Ok(result.rows_affected())
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    timestamp: i64,
    sender: String,
    content_kind: String,
    content_text: Option<String>,
    content_image_reference: Option<String>,
    status: String,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        timestamp: Timestamp::from_micros(row.timestamp),
        sender: sender_from_sql(&row.sender)?,
        content: content_from_sql(
            &row.content_kind,
            row.content_text,
            row.content_image_reference,
        )?,
        status: status_from_sql(&row.status)?,
    })
}

fn content_to_sql(content: &MessageContent) -> (&'static str, Option<&str>, Option<&str>) {
    match content {
        MessageContent::Text(text) => ("text", Some(text.as_str()), None),
        MessageContent::Image { reference } => ("image", None, Some(reference.as_str())),
    }
}

fn content_from_sql(
    kind: &str,
    text: Option<String>,
    image_reference: Option<String>,
) -> StorageResult<MessageContent> {
    match (kind, text, image_reference) {
        ("text", Some(text), None) => Ok(MessageContent::Text(text)),
        ("image", None, Some(reference)) => Ok(MessageContent::Image { reference }),
        (kind, text, image_reference) => InvariantViolationSnafu {
            stage: "message-content-from-sql",
            details: format!(
                "content kind '{kind}' with text present={} and image reference present={}",
                text.is_some(),
                image_reference.is_some()
            ),
        }
        .fail(),
    }
}

fn sender_to_sql(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "user",
        Sender::Assistant => "assistant",
    }
}

fn sender_from_sql(raw: &str) -> StorageResult<Sender> {
    match raw {
        "user" => Ok(Sender::User),
        "assistant" => Ok(Sender::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-sender-from-sql",
            details: format!("unknown message sender '{raw}'"),
        }
        .fail(),
    }
}

fn status_to_sql(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "pending",
        MessageStatus::Committed => "committed",
        MessageStatus::Failed => "failed",
    }
}

fn status_from_sql(raw: &str) -> StorageResult<MessageStatus> {
    match raw {
        "pending" => Ok(MessageStatus::Pending),
        "committed" => Ok(MessageStatus::Committed),
        "failed" => Ok(MessageStatus::Failed),
        _ => InvariantViolationSnafu {
            stage: "message-status-from-sql",
            details: format!("unknown message status '{raw}'"),
        }
        .fail(),
    }
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(micros: i64, sender: Sender, content: MessageContent) -> MessageRecord {
        MessageRecord::new(
            MessageId::new_v7(),
            Timestamp::from_micros(micros),
            sender,
            content,
            MessageStatus::Committed,
        )
    }

    #[tokio::test]
    async fn append_then_fetch_preserves_every_field() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let text = message(10, Sender::User, MessageContent::text("Hi"));
        let image = MessageRecord {
            status: MessageStatus::Failed,
            ..message(20, Sender::Assistant, MessageContent::image("file:///tmp/cat.png"))
        };

        storage.append(text.clone()).await.expect("append text");
        storage.append(image.clone()).await.expect("append image");

        let fetched = storage.fetch_all_ordered_by_time().await.expect("fetch");
        assert_eq!(fetched, vec![text, image]);
    }

    #[tokio::test]
    async fn fetch_orders_by_timestamp_not_insertion() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let late = message(300, Sender::Assistant, MessageContent::text("late"));
        let early = message(100, Sender::User, MessageContent::text("early"));
        let middle = message(200, Sender::User, MessageContent::text("middle"));

        for record in [late.clone(), early.clone(), middle.clone()] {
            storage.append(record).await.expect("append");
        }

        let fetched = storage.fetch_all_ordered_by_time().await.expect("fetch");
        assert_eq!(fetched, vec![early, middle, late]);
    }

    #[tokio::test]
    async fn delete_from_removes_inclusive_suffix() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let kept = message(1, Sender::User, MessageContent::text("kept"));
        for record in [
            kept.clone(),
            message(2, Sender::Assistant, MessageContent::text("boundary")),
            message(3, Sender::User, MessageContent::text("after")),
        ] {
            storage.append(record).await.expect("append");
        }

        let removed = storage
            .delete_from(Timestamp::from_micros(2))
            .await
            .expect("delete from");
        assert_eq!(removed, 2);
        assert_eq!(
            storage.fetch_all_ordered_by_time().await.expect("fetch"),
            vec![kept]
        );
    }

    #[tokio::test]
    async fn delete_all_empties_the_table() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        storage
            .append(message(1, Sender::User, MessageContent::text("a")))
            .await
            .expect("append");
        storage
            .append(message(2, Sender::Assistant, MessageContent::text("b")))
            .await
            .expect("append");

        assert_eq!(storage.delete_all().await.expect("delete all"), 2);
        assert!(storage.fetch_all_ordered_by_time().await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let record = message(1, Sender::User, MessageContent::text("once"));
        storage.append(record.clone()).await.expect("first append");

        let error = storage.append(record).await.expect_err("second append");
        assert!(matches!(error, StorageError::Conflict { entity: "message", .. }));
    }

    #[tokio::test]
    async fn blob_image_reference_is_rejected() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let record = message(
            1,
            Sender::User,
            MessageContent::image("data:image/png;base64,AAAA"),
        );

        let error = storage.append(record).await.expect_err("blob rejected");
        assert!(matches!(error, StorageError::Conflict { .. }));
        assert!(storage.fetch_all_ordered_by_time().await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn schema_requires_exactly_one_content_column() {
        let storage = SqliteStorage::open(":memory:").await.expect("open store");
        let both = sqlx::query(
            "INSERT INTO messages (id, timestamp, sender, content_kind, content_text, content_image_reference, status) VALUES (?, 1, 'user', 'text', 'a', 'b', 'committed')",
        )
        .bind(MessageId::new_v7().to_string())
        .execute(storage.pool())
        .await;
        assert!(both.is_err());

        let neither = sqlx::query(
            "INSERT INTO messages (id, timestamp, sender, content_kind, content_text, content_image_reference, status) VALUES (?, 1, 'user', 'image', NULL, NULL, 'committed')",
        )
        .bind(MessageId::new_v7().to_string())
        .execute(storage.pool())
        .await;
        assert!(neither.is_err());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("nested").join("history.sqlite3");
        let location = path.display().to_string();
        let record = message(42, Sender::User, MessageContent::text("persisted"));

        {
            let storage = SqliteStorage::open(&location).await.expect("open store");
            storage.append(record.clone()).await.expect("append");
            storage.pool().close().await;
        }

        let reopened = SqliteStorage::open(&location).await.expect("reopen store");
        assert_eq!(
            reopened.fetch_all_ordered_by_time().await.expect("fetch"),
            vec![record]
        );
    }

    #[test]
    fn database_urls_are_normalized() {
        assert_eq!(normalize_database_url(":memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("sqlite://a.db"), "sqlite://a.db");
        assert_eq!(normalize_database_url("/tmp/a.db"), "sqlite:///tmp/a.db");
    }
}
