use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::MessageId;
pub use memory::InMemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{MessageContent, MessageRecord, MessageStatus, Sender, Timestamp};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable, timestamp-ordered record of one conversation's messages.
///
/// Implementations serialize their own writes: two `append` calls issued back to
/// back are applied in call order and a later read observes both.
pub trait MessageStore: Send + Sync {
    /// Records one message. A second append with the same id is a conflict.
    fn append(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<()>>;

    /// Full snapshot ordered by `(timestamp, id)`.
    fn fetch_all_ordered_by_time(&self) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;

    /// Removes every message; returns how many rows were removed.
    fn delete_all(&self) -> BoxFuture<'_, StorageResult<u64>>;

    /// Removes every message with `timestamp >= from`; returns how many rows were removed.
    fn delete_from(&self, from: Timestamp) -> BoxFuture<'_, StorageResult<u64>>;
}
