//! Conversation orchestration: one task per conversation owns the message
//! sequence, drives a streaming backend, and keeps the store in step.

pub mod events;
pub mod format;
pub mod message;
pub mod session;
pub mod state;

pub use events::{Notice, StorageOperation};
pub use format::normalize_bullets;
pub use message::{Conversation, ConversationSnapshot, MessageClock, TrailingHandle};
pub use session::{
    ChatSession, DEFAULT_DRAIN_TIMEOUT, SessionConfig, SessionError, SessionResult,
};
pub use state::{GenerationState, GenerationTransition, TransitionRejection};
