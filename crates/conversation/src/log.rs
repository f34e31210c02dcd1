use std::collections::HashMap;
use std::sync::Arc;

use snafu::{OptionExt, ensure};

use super::error::{
    AlreadyFinalSnafu, DuplicateIdSnafu, LogResult, NotFoundSnafu, PendingConflictSnafu,
};
use super::ids::MessageId;
use super::types::{Message, MessageStatus, PendingMutation};

/// Ordered, append-only message sequence.
///
/// Display order is the `seq` stamped on append, never the wall clock. At most
/// one message is pending at any time. Messages are shared with snapshots and
/// copied only when a snapshot still holds the pending one.
#[derive(Debug, Clone, Default)]
pub struct ConversationLog {
    messages: Vec<Arc<Message>>,
    positions: HashMap<MessageId, usize>,
    pending: Option<MessageId>,
    next_seq: u64,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `message` at the end of the log and returns its sequence number.
    pub fn append(&mut self, mut message: Message) -> LogResult<u64> {
        ensure!(
            !self.positions.contains_key(&message.id),
            DuplicateIdSnafu {
                stage: "append-message",
                id: message.id,
            }
        );

        if message.is_pending()
            && let Some(active) = self.pending
        {
            return PendingConflictSnafu {
                stage: "append-pending-message",
                active,
                attempted: message.id,
            }
            .fail();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        message.seq = seq;

        if message.is_pending() {
            self.pending = Some(message.id);
        }
        self.positions.insert(message.id, self.messages.len());

        tracing::trace!(
            message_id = %message.id,
            seq,
            role = ?message.role,
            status = ?message.status,
            "appended message"
        );
        self.messages.push(Arc::new(message));
        Ok(seq)
    }

    /// Applies `mutation` to the pending message identified by `id`.
    pub fn update_pending(
        &mut self,
        id: MessageId,
        mutation: PendingMutation,
    ) -> LogResult<&Message> {
        let position = *self.positions.get(&id).context(NotFoundSnafu {
            stage: "update-pending-lookup",
            id,
        })?;
        let current = &self.messages[position];
        ensure!(
            current.is_pending(),
            AlreadyFinalSnafu {
                stage: "update-pending-status",
                id,
                status: current.status,
            }
        );

        let message = Arc::make_mut(&mut self.messages[position]);

        match mutation {
            PendingMutation::AppendText(fragment) => {
                message.text.push_str(&fragment);
            }
            PendingMutation::Finalize { citations } => {
                message.citations = citations;
                message.status = MessageStatus::Final;
                self.pending = None;
            }
            PendingMutation::Fail { notice } => {
                message.text = notice;
                message.status = MessageStatus::Failed;
                self.pending = None;
            }
        }

        Ok(message)
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.positions
            .get(&id)
            .map(|position| self.messages[*position].as_ref())
    }

    /// Returns the in-flight message, if any.
    pub fn pending(&self) -> Option<&Message> {
        self.pending.and_then(|id| self.get(id))
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Immutable snapshot for readers. Only the message handles are copied.
    pub fn snapshot(&self) -> Arc<[Arc<Message>]> {
        Arc::from(self.messages.as_slice())
    }
}
