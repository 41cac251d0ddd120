/// Identifier for one request/response turn.
///
/// Changes on every `append`, so terminal transitions from an older turn can
/// be told apart from the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Wraps a raw id. Sessions hand out ids starting at 1.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Lifecycle of the most recent turn in a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Streaming(TurnId),
    Done(TurnId),
    Error {
        turn: TurnId,
        message: String,
    },
    Cancelled(TurnId),
}

/// Requested change to a [`TurnState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransition {
    Start(TurnId),
    Complete(TurnId),
    Fail { turn: TurnId, message: String },
    Cancel(TurnId),
    ResetToIdle,
}

/// Why [`TurnState::apply`] refused a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnTransitionRejection {
    AlreadyStreaming { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    StillStreaming(TurnId),
    TurnMismatch { active: TurnId, attempted: TurnId },
}

pub type TurnTransitionResult = Result<TurnState, TurnTransitionRejection>;

impl TurnState {
    /// The streaming turn, if any.
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    /// True while a turn is in flight.
    pub fn is_streaming(&self) -> bool {
        self.active_turn().is_some()
    }

    /// Applies one transition.
    ///
    /// A new turn may only start when none is streaming; a terminal transition
    /// must name the streaming turn.
    pub fn apply(&self, transition: TurnTransition) -> TurnTransitionResult {
        match transition {
            TurnTransition::Start(turn) => match self {
                Self::Streaming(active) => Err(TurnTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: turn,
                }),
                Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                    Ok(Self::Streaming(turn))
                }
            },
            TurnTransition::Complete(turn) => self.finish(turn, Self::Done(turn)),
            TurnTransition::Fail { turn, message } => {
                self.finish(turn, Self::Error { turn, message })
            }
            TurnTransition::Cancel(turn) => self.finish(turn, Self::Cancelled(turn)),
            TurnTransition::ResetToIdle => match self {
                Self::Streaming(active) => Err(TurnTransitionRejection::StillStreaming(*active)),
                Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                    Ok(Self::Idle)
                }
            },
        }
    }

    fn finish(&self, turn: TurnId, next: TurnState) -> TurnTransitionResult {
        match self {
            Self::Streaming(active) if *active == turn => Ok(next),
            Self::Streaming(active) => Err(TurnTransitionRejection::TurnMismatch {
                active: *active,
                attempted: turn,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(TurnTransitionRejection::NoActiveTurn)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_start_is_rejected_while_streaming() {
        let streaming = TurnState::Idle.apply(TurnTransition::Start(TurnId(1))).unwrap();
        assert_eq!(streaming.active_turn(), Some(TurnId(1)));

        let rejection = streaming
            .apply(TurnTransition::Start(TurnId(2)))
            .unwrap_err();
        assert_eq!(
            rejection,
            TurnTransitionRejection::AlreadyStreaming {
                active: TurnId(1),
                attempted: TurnId(2),
            }
        );
    }

    #[test]
    fn terminal_transitions_must_match_the_active_turn() {
        let streaming = TurnState::Streaming(TurnId(4));
        assert_eq!(
            streaming.apply(TurnTransition::Cancel(TurnId(3))),
            Err(TurnTransitionRejection::TurnMismatch {
                active: TurnId(4),
                attempted: TurnId(3),
            })
        );
        assert_eq!(
            streaming.apply(TurnTransition::Complete(TurnId(4))),
            Ok(TurnState::Done(TurnId(4)))
        );
        assert_eq!(
            TurnState::Done(TurnId(4)).apply(TurnTransition::Complete(TurnId(4))),
            Err(TurnTransitionRejection::NoActiveTurn)
        );
    }

    #[test]
    fn finished_turns_can_restart_or_reset() {
        let failed = TurnState::Streaming(TurnId(1))
            .apply(TurnTransition::Fail {
                turn: TurnId(1),
                message: "boom".to_string(),
            })
            .unwrap();
        assert!(!failed.is_streaming());
        assert_eq!(
            failed.apply(TurnTransition::Start(TurnId(2))),
            Ok(TurnState::Streaming(TurnId(2)))
        );
        assert_eq!(failed.apply(TurnTransition::ResetToIdle), Ok(TurnState::Idle));
        assert_eq!(
            TurnState::Streaming(TurnId(9)).apply(TurnTransition::ResetToIdle),
            Err(TurnTransitionRejection::StillStreaming(TurnId(9)))
        );
    }
}
