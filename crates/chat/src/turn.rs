use parley_transport::TurnId;

/// Lifecycle of the current turn.
///
/// Only `Sending` and `Streaming` are in flight; every other state accepts a
/// new `Send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Sending(TurnId),
    Streaming(TurnId),
    Resolved(TurnId),
    Failed(TurnId),
    Cancelled(TurnId),
}

/// Input for [`TurnState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnTransition {
    Send(TurnId),
    FirstData(TurnId),
    Resolve(TurnId),
    Fail(TurnId),
    Cancel(TurnId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnTransitionRejection {
    TurnInFlight { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    TurnMismatch { active: TurnId, attempted: TurnId },
    /// `Resolve` is only valid once data was received.
    NotStreaming { active: TurnId },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    /// Turn currently in flight, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Sending(turn) | Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Resolved(_) | Self::Failed(_) | Self::Cancelled(_) => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.active_turn().is_some()
    }

    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Send(turn) => self.apply_send(turn),
            TurnTransition::FirstData(turn) => self.apply_first_data(turn),
            TurnTransition::Resolve(turn) => self.apply_resolve(turn),
            TurnTransition::Fail(turn) => self.settle_active(turn, Self::Failed),
            TurnTransition::Cancel(turn) => self.settle_active(turn, Self::Cancelled),
        }
    }

    fn apply_send(&self, turn: TurnId) -> TurnTransitionResult {
        match self.active_turn() {
            Some(active) => Err(TurnTransitionRejection::TurnInFlight {
                active,
                attempted: turn,
            }),
            None => Ok(Self::Sending(turn)),
        }
    }

    fn apply_first_data(&self, turn: TurnId) -> TurnTransitionResult {
        match self {
            Self::Sending(active) | Self::Streaming(active) if *active == turn => {
                Ok(Self::Streaming(turn))
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TurnTransitionRejection::TurnMismatch {
                    active: *active,
                    attempted: turn,
                })
            }
            Self::Idle | Self::Resolved(_) | Self::Failed(_) | Self::Cancelled(_) => {
                Err(TurnTransitionRejection::NoActiveTurn)
            }
        }
    }

    fn apply_resolve(&self, turn: TurnId) -> TurnTransitionResult {
        match self {
            Self::Streaming(active) if *active == turn => Ok(Self::Resolved(turn)),
            Self::Sending(active) if *active == turn => {
                Err(TurnTransitionRejection::NotStreaming { active: *active })
            }
            Self::Sending(active) | Self::Streaming(active) => {
                Err(TurnTransitionRejection::TurnMismatch {
                    active: *active,
                    attempted: turn,
                })
            }
            Self::Idle | Self::Resolved(_) | Self::Failed(_) | Self::Cancelled(_) => {
                Err(TurnTransitionRejection::NoActiveTurn)
            }
        }
    }

    fn settle_active(&self, turn: TurnId, settled: fn(TurnId) -> Self) -> TurnTransitionResult {
        match self.active_turn() {
            Some(active) if active == turn => Ok(settled(turn)),
            Some(active) => Err(TurnTransitionRejection::TurnMismatch {
                active,
                attempted: turn,
            }),
            None => Err(TurnTransitionRejection::NoActiveTurn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TURN: TurnId = TurnId::new(1);
    const OTHER: TurnId = TurnId::new(2);

    #[test]
    fn happy_path_walks_sending_streaming_resolved() {
        let state = TurnState::Idle
            .apply(TurnTransition::Send(TURN))
            .and_then(|state| state.apply(TurnTransition::FirstData(TURN)))
            .and_then(|state| state.apply(TurnTransition::FirstData(TURN)))
            .and_then(|state| state.apply(TurnTransition::Resolve(TURN)));

        assert_eq!(state, Ok(TurnState::Resolved(TURN)));
    }

    #[test]
    fn send_is_rejected_while_in_flight() {
        for state in [TurnState::Sending(TURN), TurnState::Streaming(TURN)] {
            assert_eq!(
                state.apply(TurnTransition::Send(OTHER)),
                Err(TurnTransitionRejection::TurnInFlight {
                    active: TURN,
                    attempted: OTHER,
                })
            );
        }
    }

    #[test]
    fn settled_states_accept_a_new_send() {
        for state in [
            TurnState::Idle,
            TurnState::Resolved(TURN),
            TurnState::Failed(TURN),
            TurnState::Cancelled(TURN),
        ] {
            assert_eq!(
                state.apply(TurnTransition::Send(OTHER)),
                Ok(TurnState::Sending(OTHER))
            );
        }
    }

    #[test]
    fn failure_is_valid_before_and_after_first_data() {
        assert_eq!(
            TurnState::Sending(TURN).apply(TurnTransition::Fail(TURN)),
            Ok(TurnState::Failed(TURN))
        );
        assert_eq!(
            TurnState::Streaming(TURN).apply(TurnTransition::Fail(TURN)),
            Ok(TurnState::Failed(TURN))
        );
    }

    #[test]
    fn resolve_requires_streaming() {
        assert_eq!(
            TurnState::Sending(TURN).apply(TurnTransition::Resolve(TURN)),
            Err(TurnTransitionRejection::NotStreaming { active: TURN })
        );
    }

    #[test]
    fn settled_turns_reject_cancel() {
        assert_eq!(
            TurnState::Resolved(TURN).apply(TurnTransition::Cancel(TURN)),
            Err(TurnTransitionRejection::NoActiveTurn)
        );
    }

    #[test]
    fn stale_turn_is_rejected() {
        assert_eq!(
            TurnState::Streaming(TURN).apply(TurnTransition::Cancel(OTHER)),
            Err(TurnTransitionRejection::TurnMismatch {
                active: TURN,
                attempted: OTHER,
            })
        );
    }
}
