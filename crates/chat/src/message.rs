use murmur_storage::{
    MessageContent, MessageId, MessageRecord, MessageStatus, Sender, Timestamp,
};

/// Snapshot published to observers after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub messages: Vec<MessageRecord>,
    pub generating: bool,
}

impl ConversationSnapshot {
    pub fn last(&self) -> Option<&MessageRecord> {
        self.messages.last()
    }

    /// The message that is still streaming, if any.
    pub fn pending_assistant(&self) -> Option<&MessageRecord> {
        self.messages.iter().rev().find(|message| {
            message.sender == Sender::Assistant && message.status == MessageStatus::Pending
        })
    }
}

/// Position of the message being streamed into.
///
/// Only valid for the revision it was issued against; any structural mutation
/// (truncate, clear, replace) retires it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingHandle {
    index: usize,
    id: MessageId,
    revision: u64,
}

impl TrailingHandle {
    pub fn id(&self) -> MessageId {
        self.id
    }
}

/// Ordered in-memory conversation.
///
/// Append-only apart from in-place edits of the trailing message and suffix
/// truncation. Timestamps are non-decreasing along the sequence.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<MessageRecord>,
    revision: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: MessageRecord) -> TrailingHandle {
        let handle = TrailingHandle {
            index: self.messages.len(),
            id: message.id,
            revision: self.revision,
        };
        self.messages.push(message);
        handle
    }

    pub fn get(&self, handle: &TrailingHandle) -> Option<&MessageRecord> {
        if handle.revision != self.revision {
            return None;
        }
        self.messages
            .get(handle.index)
            .filter(|message| message.id == handle.id)
    }

    pub fn get_mut(&mut self, handle: &TrailingHandle) -> Option<&mut MessageRecord> {
        if handle.revision != self.revision {
            return None;
        }
        self.messages
            .get_mut(handle.index)
            .filter(|message| message.id == handle.id)
    }

    /// Appends a fragment to the text of the handled message. Returns false when
    /// the handle no longer resolves or the message is not text.
    pub fn append_text(&mut self, handle: &TrailingHandle, fragment: &str) -> bool {
        match self.get_mut(handle).map(|message| &mut message.content) {
            Some(MessageContent::Text(text)) => {
                text.push_str(fragment);
                true
            }
            _ => false,
        }
    }

    /// Removes the handled message if it is still the last one.
    pub fn remove_trailing(&mut self, handle: &TrailingHandle) -> Option<MessageRecord> {
        self.get(handle)?;
        if handle.index + 1 != self.messages.len() {
            return None;
        }
        self.messages.pop()
    }

    /// Drops every message with `timestamp >= from`; returns how many were removed.
    pub fn truncate_from(&mut self, from: Timestamp) -> usize {
        let keep = self
            .messages
            .partition_point(|message| message.timestamp < from);
        let removed = self.messages.len() - keep;
        if removed > 0 {
            self.messages.truncate(keep);
            self.bump();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.bump();
    }

    /// Replaces the whole sequence, e.g. with a freshly loaded history.
    pub fn replace(&mut self, mut messages: Vec<MessageRecord>) {
        messages.sort_by_key(|message| (message.timestamp, message.id));
        self.messages = messages;
        self.bump();
    }

    pub fn newest_timestamp(&self) -> Option<Timestamp> {
        self.messages.iter().map(|message| message.timestamp).max()
    }

    pub fn snapshot(&self, generating: bool) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            generating,
        }
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }
}

/// Issues strictly increasing timestamps for new messages.
#[derive(Debug, Clone, Default)]
pub struct MessageClock {
    last: Option<Timestamp>,
}

impl MessageClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> Timestamp {
        self.next_after(Timestamp::now())
    }

    /// Makes every later timestamp sort after `seen`.
    pub fn observe(&mut self, seen: Timestamp) {
        if self.last.is_none_or(|last| seen > last) {
            self.last = Some(seen);
        }
    }

    fn next_after(&mut self, now: Timestamp) -> Timestamp {
        let next = match self.last {
            Some(last) if now <= last => Timestamp::from_micros(last.as_micros().saturating_add(1)),
            _ => now,
        };
        self.last = Some(next);
        next
    }
}

pub(crate) fn user_message(timestamp: Timestamp, text: &str) -> MessageRecord {
    MessageRecord::new(
        MessageId::new_v7(),
        timestamp,
        Sender::User,
        MessageContent::text(text),
        MessageStatus::Committed,
    )
}

pub(crate) fn assistant_placeholder(timestamp: Timestamp) -> MessageRecord {
    MessageRecord::new(
        MessageId::new_v7(),
        timestamp,
        Sender::Assistant,
        MessageContent::text(String::new()),
        MessageStatus::Pending,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(micros: i64, sender: Sender, text: &str) -> MessageRecord {
        MessageRecord::new(
            MessageId::new_v7(),
            Timestamp::from_micros(micros),
            sender,
            MessageContent::text(text),
            MessageStatus::Committed,
        )
    }

    #[test]
    fn clock_never_repeats_or_goes_back() {
        let mut clock = MessageClock::new();
        let frozen = Timestamp::from_micros(100);
        let first = clock.next_after(frozen);
        let second = clock.next_after(frozen);
        let third = clock.next_after(Timestamp::from_micros(50));
        assert_eq!(first, Timestamp::from_micros(100));
        assert_eq!(second, Timestamp::from_micros(101));
        assert_eq!(third, Timestamp::from_micros(102));
        assert_eq!(
            clock.next_after(Timestamp::from_micros(500)),
            Timestamp::from_micros(500)
        );
    }

    #[test]
    fn clock_moves_past_observed_history() {
        let mut clock = MessageClock::new();
        clock.observe(Timestamp::from_micros(i64::MAX - 10));
        assert!(clock.next() > Timestamp::from_micros(i64::MAX - 10));
        clock.observe(Timestamp::from_micros(1));
        assert!(clock.next_after(Timestamp::from_micros(2)) > Timestamp::from_micros(i64::MAX - 10));
    }

    #[test]
    fn fragments_land_in_the_trailing_message() {
        let mut conversation = Conversation::new();
        conversation.push(at(1, Sender::User, "Hi"));
        let handle = conversation.push(assistant_placeholder(Timestamp::from_micros(2)));

        for fragment in ["H", "e", "l", "l", "o"] {
            assert!(conversation.append_text(&handle, fragment));
        }

        assert_eq!(conversation.get(&handle).map(MessageRecord::text), Some("Hello"));
        assert_eq!(
            conversation.snapshot(true).pending_assistant().map(|m| m.id),
            Some(handle.id())
        );
    }

    #[test]
    fn structural_mutation_retires_the_handle() {
        let mut conversation = Conversation::new();
        conversation.push(at(1, Sender::User, "Hi"));
        let handle = conversation.push(at(2, Sender::Assistant, ""));

        assert_eq!(conversation.truncate_from(Timestamp::from_micros(5)), 0);
        assert!(conversation.get(&handle).is_some());

        assert_eq!(conversation.truncate_from(Timestamp::from_micros(2)), 1);
        assert!(conversation.get(&handle).is_none());
        assert!(!conversation.append_text(&handle, "x"));

        let handle = conversation.push(at(3, Sender::Assistant, ""));
        conversation.clear();
        assert!(conversation.remove_trailing(&handle).is_none());
        assert!(conversation.is_empty());
    }

    #[test]
    fn truncate_from_keeps_only_older_messages() {
        let mut conversation = Conversation::new();
        for micros in [10, 20, 30, 40] {
            conversation.push(at(micros, Sender::User, "m"));
        }

        assert_eq!(conversation.truncate_from(Timestamp::from_micros(25)), 2);
        let left: Vec<i64> = conversation
            .messages()
            .iter()
            .map(|message| message.timestamp.as_micros())
            .collect();
        assert_eq!(left, vec![10, 20]);
    }

    #[test]
    fn replace_orders_loaded_history() {
        let mut conversation = Conversation::new();
        conversation.replace(vec![
            at(30, Sender::Assistant, "c"),
            at(10, Sender::User, "a"),
            at(20, Sender::Assistant, "b"),
        ]);
        let texts: Vec<&str> = conversation.messages().iter().map(MessageRecord::text).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert_eq!(conversation.newest_timestamp(), Some(Timestamp::from_micros(30)));
    }

    #[test]
    fn remove_trailing_requires_last_position() {
        let mut conversation = Conversation::new();
        let first = conversation.push(at(1, Sender::Assistant, ""));
        conversation.push(at(2, Sender::User, "later"));
        assert!(conversation.remove_trailing(&first).is_none());
        assert_eq!(conversation.len(), 2);
    }
}
