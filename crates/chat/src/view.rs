use std::sync::Arc;

use arc_swap::ArcSwap;
use parley_conversation::Message;

use super::turn::TurnState;

/// Published state of one session at a point in time.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub messages: Arc<[Arc<Message>]>,
    pub turn_state: TurnState,
    /// Bumped on every publish.
    pub revision: u64,
}

impl LogSnapshot {
    pub(crate) fn empty() -> Self {
        Self {
            messages: Vec::<Arc<Message>>::new().into(),
            turn_state: TurnState::Idle,
            revision: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.turn_state.is_in_flight()
    }
}

/// Cloneable read-only view over a session's conversation.
///
/// Readers never block the session; each [`Self::load`] returns the latest
/// complete snapshot.
#[derive(Debug, Clone)]
pub struct LogView {
    shared: Arc<ArcSwap<LogSnapshot>>,
}

impl LogView {
    pub(crate) fn new(shared: Arc<ArcSwap<LogSnapshot>>) -> Self {
        Self { shared }
    }

    pub fn load(&self) -> Arc<LogSnapshot> {
        self.shared.load_full()
    }

    pub fn messages(&self) -> Arc<[Arc<Message>]> {
        Arc::clone(&self.shared.load().messages)
    }

    pub fn is_pending(&self) -> bool {
        self.shared.load().is_pending()
    }

    pub fn turn_state(&self) -> TurnState {
        self.shared.load().turn_state
    }

    pub fn revision(&self) -> u64 {
        self.shared.load().revision
    }
}
