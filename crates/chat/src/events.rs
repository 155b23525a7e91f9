use murmur_llm::GenerationId;
use murmur_storage::Timestamp;
use tokio::sync::oneshot;

/// Non-fatal condition surfaced to observers. Backend and store failures end up
/// here instead of as `Err` results of the command API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The backend could not serve the request; no assistant message was kept.
    BackendUnavailable {
        generation: GenerationId,
        message: String,
    },
    /// The stream failed part way; partial content was kept as `failed`.
    StreamFailed {
        generation: GenerationId,
        message: String,
    },
    StorageFailed {
        operation: StorageOperation,
        message: String,
    },
    /// A command was refused in the current state.
    Rejected {
        command: &'static str,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageOperation {
    Append,
    Fetch,
    DeleteAll,
    DeleteFrom,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Fetch => "fetch",
            Self::DeleteAll => "delete-all",
            Self::DeleteFrom => "delete-from",
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendUnavailable { message, .. } => {
                write!(formatter, "backend unavailable: {message}")
            }
            Self::StreamFailed { message, .. } => write!(formatter, "response failed: {message}"),
            Self::StorageFailed { operation, message } => {
                write!(formatter, "storage {} failed: {message}", operation.as_str())
            }
            Self::Rejected { command, reason } => write!(formatter, "{command} rejected: {reason}"),
        }
    }
}

/// Requests handled by the session task. Each carries an ack that fires once
/// the command's synchronous part is done.
#[derive(Debug)]
pub(crate) enum Command {
    Send {
        text: String,
        ack: oneshot::Sender<()>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
    ClearHistory {
        ack: oneshot::Sender<()>,
    },
    DeleteFrom {
        from: Timestamp,
        ack: oneshot::Sender<()>,
    },
    LoadHistory {
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Stop { .. } => "stop",
            Self::ClearHistory { .. } => "clear-history",
            Self::DeleteFrom { .. } => "delete-from",
            Self::LoadHistory { .. } => "load-history",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notices_render_for_display() {
        let notice = Notice::StorageFailed {
            operation: StorageOperation::DeleteFrom,
            message: "disk full".to_string(),
        };
        assert_eq!(notice.to_string(), "storage delete-from failed: disk full");

        let notice = Notice::BackendUnavailable {
            generation: GenerationId::new(3),
            message: "connection refused".to_string(),
        };
        assert_eq!(notice.to_string(), "backend unavailable: connection refused");
    }
}
