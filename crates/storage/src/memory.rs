use std::collections::{BTreeMap, HashSet};

use tokio::sync::Mutex;
use uuid::Uuid;

use super::error::{ConflictSnafu, StorageResult};
use super::ids::MessageId;
use super::types::{MessageRecord, Timestamp, validate_image_reference};
use super::{BoxFuture, MessageStore};

/// Process-local store with the same contract as [`crate::SqliteStorage`].
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: BTreeMap<(Timestamp, MessageId), MessageRecord>,
    ids: HashSet<MessageId>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.messages.is_empty()
    }
}

impl MessageStore for InMemoryStorage {
    fn append(&self, message: MessageRecord) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            validate_image_reference(&message.content, "memory-append-validate")?;

            let mut state = self.state.lock().await;
            if !state.ids.insert(message.id) {
                return ConflictSnafu {
                    stage: "memory-append-duplicate",
                    entity: "message",
                    details: format!("message '{}' was already persisted", message.id),
                }
                .fail();
            }

            state
                .messages
                .insert((message.timestamp, message.id), message);
            Ok(())
        })
    }

    fn fetch_all_ordered_by_time(&self) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.messages.values().cloned().collect())
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let removed = state.messages.len() as u64;
            state.messages.clear();
            state.ids.clear();
            Ok(removed)
        })
    }

    fn delete_from(&self, from: Timestamp) -> BoxFuture<'_, StorageResult<u64>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let removed = state.messages.split_off(&(from, MessageId::new(Uuid::nil())));
            for (_, id) in removed.keys() {
                state.ids.remove(id);
            }
            Ok(removed.len() as u64)
        })
    }
}
