use super::types::State;

/// Lifecycle graph of a task. Deletion may be requested from anywhere; the
/// record itself is removed by the monitor, so nothing leaves `Deleting`.
pub fn valid_state_transition(src: &State, dst: &State) -> bool {
    match (src, dst) {
        (_, State::Deleting) => *src != State::Deleting,
        (State::Scheduled, State::Pending | State::Failed) => true,
        (State::Pending, State::Running | State::Succeeded | State::Failed) => true,
        (State::Running, State::Succeeded | State::Failed) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 6] = [
        State::Scheduled,
        State::Pending,
        State::Running,
        State::Succeeded,
        State::Failed,
        State::Deleting,
    ];

    #[test]
    fn test_lifecycle_edges() {
        assert!(valid_state_transition(&State::Scheduled, &State::Pending));
        assert!(valid_state_transition(&State::Scheduled, &State::Failed));
        assert!(valid_state_transition(&State::Pending, &State::Running));
        assert!(valid_state_transition(&State::Pending, &State::Succeeded));
        assert!(valid_state_transition(&State::Running, &State::Failed));
    }

    #[test]
    fn test_running_requires_pending_first() {
        assert!(!valid_state_transition(&State::Scheduled, &State::Running));
        assert!(!valid_state_transition(&State::Scheduled, &State::Succeeded));
        assert!(!valid_state_transition(&State::Running, &State::Pending));
    }

    #[test]
    fn test_terminal_states_only_accept_deletion() {
        for src in [State::Succeeded, State::Failed] {
            for dst in ALL {
                assert_eq!(
                    valid_state_transition(&src, &dst),
                    dst == State::Deleting,
                    "{} -> {}",
                    src,
                    dst
                );
            }
        }
    }

    #[test]
    fn test_deleting_is_final() {
        for dst in ALL {
            assert!(!valid_state_transition(&State::Deleting, &dst));
        }
    }
}
