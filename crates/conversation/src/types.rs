use std::time::SystemTime;

use super::ids::MessageId;

/// Speaker of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Bot,
}

/// Lifecycle status for one message.
///
/// `Final` and `Failed` are both settled: the log rejects further mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Pending,
    Final,
    Failed,
}

/// Document chunk the backend used to produce an answer.
///
/// Conversation-local type, intentionally decoupled from the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Citation {
    pub source: String,
    /// `-1` when the backend could not tell which chunk was used.
    pub chunk_index: i64,
}

impl Citation {
    pub fn new(source: impl Into<String>, chunk_index: i64) -> Self {
        Self {
            source: source.into(),
            chunk_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    /// Display position, assigned by [`crate::ConversationLog::append`].
    pub seq: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: SystemTime,
    pub status: MessageStatus,
    pub citations: Vec<Citation>,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new_v7(),
            seq: 0,
            role,
            text: text.into(),
            timestamp: SystemTime::now(),
            status,
            citations: Vec::new(),
        }
    }

    /// User utterances are authoritative as soon as they are submitted.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text, MessageStatus::Final)
    }

    /// Settled bot message, e.g. a greeting shown before the first turn.
    pub fn bot(text: impl Into<String>) -> Self {
        Self::new(Role::Bot, text, MessageStatus::Final)
    }

    /// Empty bot placeholder that is filled in while a reply arrives.
    pub fn bot_pending() -> Self {
        Self::new(Role::Bot, String::new(), MessageStatus::Pending)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, MessageStatus::Pending)
    }
}

/// Reducer input applied to the pending message by
/// [`crate::ConversationLog::update_pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMutation {
    /// Appends a streamed fragment; never reorders existing text.
    AppendText(String),
    Finalize { citations: Vec<Citation> },
    /// Replaces the partial text with a user-facing notice.
    Fail { notice: String },
}
