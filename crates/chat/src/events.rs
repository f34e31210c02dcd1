use parley_conversation::MessageId;
use parley_transport::{StreamFault, TransportError, TurnId};

/// Result of [`crate::ChatSession::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendOutcome {
    /// Blank input; nothing was appended and no connection was opened.
    Ignored,
    Started(TurnId),
}

impl SendOutcome {
    pub fn turn(self) -> Option<TurnId> {
        match self {
            Self::Ignored => None,
            Self::Started(turn) => Some(turn),
        }
    }
}

/// One folded transport signal, as reported by
/// [`crate::ChatSession::next_update`].
#[derive(Debug)]
pub enum TurnUpdate {
    /// The reply is still in flight. `deltas` counts the fragments appended
    /// by this step and may be zero when a chunk ended mid-frame.
    Progress {
        turn: TurnId,
        message_id: MessageId,
        deltas: usize,
    },
    Settled(TurnOutcome),
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub turn: TurnId,
    /// Bot message the turn resolved or failed.
    pub message_id: MessageId,
    pub resolution: TurnResolution,
}

#[derive(Debug)]
pub enum TurnResolution {
    Resolved,
    Failed(TurnFailure),
    Cancelled,
}

impl TurnResolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// Why a turn ended in `Failed`.
#[derive(Debug)]
pub enum TurnFailure {
    /// The reply body could not be decoded, or the backend sent an error frame.
    Stream(StreamFault),
    Transport(TransportError),
}

impl TurnFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Timeout { .. }))
    }
}
