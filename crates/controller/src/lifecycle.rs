//! Segment lifecycle state machine
//!
//! Validates and records state changes of (segment, instance) pairs. Allowed
//! transitions:
//!
//! ```text
//! OFFLINE   -> CONSUMING | ONLINE | ERROR | DROPPED
//! CONSUMING -> ONLINE | ERROR | DROPPED
//! ONLINE    -> ERROR | DROPPED
//! ERROR     -> OFFLINE | DROPPED
//! DROPPED   -> (none)
//! ```
//!
//! Intermediate states are never inferred: a request whose target is not
//! directly reachable from the recorded state is rejected and the recorded
//! state is left untouched.

use tracing::debug;

use crate::error::{AssignmentError, Result};
use crate::metadata::{Assignment, SegmentState};

impl SegmentState {
    /// Whether `self -> to` is an allowed transition
    pub fn can_transition_to(&self, to: SegmentState) -> bool {
        use SegmentState::*;

        match (*self, to) {
            (Dropped, _) => false,
            (_, Dropped) => true,
            (Offline, Consuming) | (Offline, Online) | (Consuming, Online) => true,
            (Offline | Consuming | Online, Error) => true,
            (Error, Offline) => true,
            _ => false,
        }
    }
}

/// Validate a transition without recording it
pub fn validate(segment: &str, instance: &str, from: SegmentState, to: SegmentState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(AssignmentError::IllegalTransition {
            segment: segment.to_string(),
            instance: instance.to_string(),
            from,
            to,
        })
    }
}

/// Apply a transition to a recorded replica
///
/// Returns the previous state.
pub fn transition(
    table: &str,
    assignment: &mut Assignment,
    segment: &str,
    instance: &str,
    to: SegmentState,
) -> Result<SegmentState> {
    let from = assignment
        .state(segment, instance)
        .ok_or_else(|| AssignmentError::ReplicaNotFound {
            table: table.to_string(),
            segment: segment.to_string(),
            instance: instance.to_string(),
        })?;

    validate(segment, instance, from, to)?;
    assignment.set_state(segment, instance, to);
    debug!("{}/{} on {}: {} -> {}", table, segment, instance, from, to);
    Ok(from)
}

/// Record a new replica, entering the lifecycle at OFFLINE
///
/// `initial` must be OFFLINE, CONSUMING or ONLINE. A previously dropped pair
/// is a retired replica, so the new one replaces it. Recording over a live
/// replica is rejected.
pub fn record_new(
    assignment: &mut Assignment,
    segment: &str,
    instance: &str,
    initial: SegmentState,
) -> Result<()> {
    if let Some(existing) = assignment.state(segment, instance) {
        if !existing.is_terminal() {
            return Err(AssignmentError::IllegalTransition {
                segment: segment.to_string(),
                instance: instance.to_string(),
                from: existing,
                to: initial,
            });
        }
    }

    if !matches!(initial, SegmentState::Offline) && !initial.is_serving() {
        return Err(AssignmentError::IllegalTransition {
            segment: segment.to_string(),
            instance: instance.to_string(),
            from: SegmentState::Offline,
            to: initial,
        });
    }
    assignment.set_state(segment, instance, initial);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use SegmentState::*;

    const ALLOWED: &[(SegmentState, SegmentState)] = &[
        (Offline, Consuming),
        (Offline, Online),
        (Consuming, Online),
        (Offline, Error),
        (Consuming, Error),
        (Online, Error),
        (Error, Offline),
        (Offline, Dropped),
        (Consuming, Dropped),
        (Online, Dropped),
        (Error, Dropped),
    ];

    #[test]
    fn test_transition_table_is_exact() {
        for from in SegmentState::ALL {
            for to in SegmentState::ALL {
                let expected = ALLOWED.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_dropped_is_terminal() {
        for to in SegmentState::ALL {
            assert!(!Dropped.can_transition_to(to));
        }
    }

    #[test]
    fn test_rejected_transition_keeps_state() {
        let mut assignment = Assignment::new();
        assignment.set_state("seg_1", "server_a", Consuming);

        let err = transition("events", &mut assignment, "seg_1", "server_a", Offline).unwrap_err();
        assert!(matches!(
            err,
            AssignmentError::IllegalTransition {
                from: Consuming,
                to: Offline,
                ..
            }
        ));
        assert_eq!(assignment.state("seg_1", "server_a"), Some(Consuming));
    }

    #[test]
    fn test_transition_returns_previous() {
        let mut assignment = Assignment::new();
        assignment.set_state("seg_1", "server_a", Consuming);

        let previous = transition("events", &mut assignment, "seg_1", "server_a", Online).unwrap();
        assert_eq!(previous, Consuming);
        assert_eq!(assignment.state("seg_1", "server_a"), Some(Online));
    }

    #[test]
    fn test_transition_unknown_pair() {
        let mut assignment = Assignment::new();
        let err = transition("events", &mut assignment, "seg_1", "server_a", Online).unwrap_err();
        assert!(matches!(err, AssignmentError::ReplicaNotFound { .. }));
    }

    #[test]
    fn test_record_new() {
        let mut assignment = Assignment::new();
        record_new(&mut assignment, "seg_1", "server_a", Consuming).unwrap();
        assert_eq!(assignment.state("seg_1", "server_a"), Some(Consuming));

        // live replica cannot be recorded twice
        assert!(record_new(&mut assignment, "seg_1", "server_a", Online).is_err());

        // only OFFLINE and serving states are entry states
        assert!(record_new(&mut assignment, "seg_2", "server_a", Error).is_err());
        assert!(record_new(&mut assignment, "seg_3", "server_a", Dropped).is_err());
        assert_eq!(assignment.state("seg_2", "server_a"), None);

        // retired replica may be replaced
        assignment.set_state("seg_4", "server_a", Dropped);
        record_new(&mut assignment, "seg_4", "server_a", Offline).unwrap();
        assert_eq!(assignment.state("seg_4", "server_a"), Some(Offline));
    }
}
