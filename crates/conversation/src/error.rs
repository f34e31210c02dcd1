use snafu::Snafu;

use super::ids::MessageId;
use super::types::MessageStatus;

/// Contract violations reported by [`crate::ConversationLog`].
///
/// These indicate a bug in the caller rather than a runtime fault, so callers
/// are expected to propagate them instead of recovering.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogError {
    #[snafu(display("message '{id}' is already in the conversation log"))]
    DuplicateId { stage: &'static str, id: MessageId },
    #[snafu(display("no message with id '{id}' exists in the conversation log"))]
    NotFound { stage: &'static str, id: MessageId },
    #[snafu(display("message '{id}' is {status:?} and can no longer be mutated"))]
    AlreadyFinal {
        stage: &'static str,
        id: MessageId,
        status: MessageStatus,
    },
    #[snafu(display(
        "cannot append pending message '{attempted}' while '{active}' is still pending"
    ))]
    PendingConflict {
        stage: &'static str,
        active: MessageId,
        attempted: MessageId,
    },
}

pub type LogResult<T> = Result<T, LogError>;
