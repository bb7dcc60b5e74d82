use super::types::State;

/// Returns whether a task may move from `from` to `to`.
///
/// Scheduled and Running permit self-transitions so that re-observations of
/// an unchanged task do not fail validation. Failed re-arms to Scheduled for
/// restarts. Complete is terminal.
pub fn valid_state_transition(from: State, to: State) -> bool {
    let allowed: &[State] = match from {
        State::Pending => &[State::Scheduled],
        State::Scheduled => &[State::Scheduled, State::Running, State::Failed],
        State::Running => &[State::Running, State::Failed, State::Complete],
        State::Failed => &[State::Scheduled],
        State::Complete => &[],
    };
    allowed.contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_only_moves_to_scheduled() {
        assert!(valid_state_transition(State::Pending, State::Scheduled));
        assert!(!valid_state_transition(State::Pending, State::Pending));
        assert!(!valid_state_transition(State::Pending, State::Running));
        assert!(!valid_state_transition(State::Pending, State::Failed));
        assert!(!valid_state_transition(State::Pending, State::Complete));
    }

    #[test]
    fn self_transition_is_legal_only_while_scheduled_or_running() {
        assert!(valid_state_transition(State::Scheduled, State::Scheduled));
        assert!(valid_state_transition(State::Running, State::Running));
        assert!(!valid_state_transition(State::Pending, State::Pending));
        assert!(!valid_state_transition(State::Failed, State::Failed));
        assert!(!valid_state_transition(State::Complete, State::Complete));
    }

    #[test]
    fn scheduled_moves_to_running_or_failed() {
        assert!(valid_state_transition(State::Scheduled, State::Running));
        assert!(valid_state_transition(State::Scheduled, State::Failed));
        assert!(!valid_state_transition(State::Scheduled, State::Complete));
        assert!(!valid_state_transition(State::Scheduled, State::Pending));
    }

    #[test]
    fn running_moves_to_failed_or_complete() {
        assert!(valid_state_transition(State::Running, State::Failed));
        assert!(valid_state_transition(State::Running, State::Complete));
        assert!(!valid_state_transition(State::Running, State::Scheduled));
        assert!(!valid_state_transition(State::Running, State::Pending));
    }

    #[test]
    fn failed_rearms_to_scheduled() {
        assert!(valid_state_transition(State::Failed, State::Scheduled));
        assert!(!valid_state_transition(State::Failed, State::Running));
        assert!(!valid_state_transition(State::Failed, State::Complete));
    }

    #[test]
    fn complete_is_terminal() {
        for to in [
            State::Pending,
            State::Scheduled,
            State::Running,
            State::Failed,
            State::Complete,
        ] {
            assert!(!valid_state_transition(State::Complete, to));
        }
    }
}
