use murmur_llm::GenerationId;

/// Generation lifecycle for one conversation.
///
/// `Cancelling` is still "generating" from the outside: stop has been signalled
/// but fragments already in flight are being drained before the final persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    Generating(GenerationId),
    Cancelling(GenerationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationTransition {
    Start(GenerationId),
    RequestCancel(GenerationId),
    Finish(GenerationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRejection {
    AlreadyGenerating {
        active: GenerationId,
        attempted: GenerationId,
    },
    NoActiveGeneration,
    GenerationMismatch {
        active: GenerationId,
        attempted: GenerationId,
    },
}

pub type TransitionResult = Result<GenerationState, TransitionRejection>;

impl GenerationState {
    pub fn active_generation(&self) -> Option<GenerationId> {
        match self {
            Self::Generating(generation) | Self::Cancelling(generation) => Some(*generation),
            Self::Idle => None,
        }
    }

    pub fn is_generating(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    /// True when events tagged with `generation` belong to the running stream.
    pub fn accepts_stream_event(&self, generation: GenerationId) -> bool {
        self.active_generation() == Some(generation)
    }

    /// Applies one transition. `Start` is only legal from `Idle`; the others must
    /// name the active generation exactly.
    pub fn apply(&self, transition: GenerationTransition) -> TransitionResult {
        match transition {
            GenerationTransition::Start(generation) => match self {
                Self::Idle => Ok(Self::Generating(generation)),
                Self::Generating(active) | Self::Cancelling(active) => {
                    Err(TransitionRejection::AlreadyGenerating {
                        active: *active,
                        attempted: generation,
                    })
                }
            },
            GenerationTransition::RequestCancel(generation) => {
                self.with_active(generation, Self::Cancelling(generation))
            }
            GenerationTransition::Finish(generation) => self.with_active(generation, Self::Idle),
        }
    }

    fn with_active(&self, generation: GenerationId, next: Self) -> TransitionResult {
        match self.active_generation() {
            Some(active) if active == generation => Ok(next),
            Some(active) => Err(TransitionRejection::GenerationMismatch {
                active,
                attempted: generation,
            }),
            None => Err(TransitionRejection::NoActiveGeneration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIRST: GenerationId = GenerationId::new(1);
    const SECOND: GenerationId = GenerationId::new(2);

    #[test]
    fn full_cycle_returns_to_idle() {
        let state = GenerationState::Idle;
        let state = state.apply(GenerationTransition::Start(FIRST)).expect("start");
        assert!(state.is_generating());
        let state = state
            .apply(GenerationTransition::RequestCancel(FIRST))
            .expect("cancel");
        assert_eq!(state, GenerationState::Cancelling(FIRST));
        assert!(state.accepts_stream_event(FIRST));
        let state = state.apply(GenerationTransition::Finish(FIRST)).expect("finish");
        assert_eq!(state, GenerationState::Idle);
    }

    #[test]
    fn start_is_rejected_while_generating() {
        let state = GenerationState::Generating(FIRST);
        assert_eq!(
            state.apply(GenerationTransition::Start(SECOND)),
            Err(TransitionRejection::AlreadyGenerating {
                active: FIRST,
                attempted: SECOND
            })
        );
        assert_eq!(
            GenerationState::Cancelling(FIRST).apply(GenerationTransition::Start(SECOND)),
            Err(TransitionRejection::AlreadyGenerating {
                active: FIRST,
                attempted: SECOND
            })
        );
    }

    #[test]
    fn stale_generation_cannot_finish_the_active_one() {
        let state = GenerationState::Generating(SECOND);
        assert!(!state.accepts_stream_event(FIRST));
        assert_eq!(
            state.apply(GenerationTransition::Finish(FIRST)),
            Err(TransitionRejection::GenerationMismatch {
                active: SECOND,
                attempted: FIRST
            })
        );
    }

    #[test]
    fn idle_rejects_cancel_and_finish() {
        let state = GenerationState::Idle;
        assert_eq!(
            state.apply(GenerationTransition::RequestCancel(FIRST)),
            Err(TransitionRejection::NoActiveGeneration)
        );
        assert_eq!(
            state.apply(GenerationTransition::Finish(FIRST)),
            Err(TransitionRejection::NoActiveGeneration)
        );
    }
}
