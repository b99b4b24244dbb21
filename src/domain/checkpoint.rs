use serde::{Deserialize, Serialize};
use std::fmt;

/// Deal progress marker. Ordered: a deal's checkpoint never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Checkpoint {
    /// Proposal accepted, resources reserved
    Accepted,
    /// Payload received into the staging area (or imported for offline deals)
    Transferred,
    /// Deal publish message sent
    Published,
    /// Deal publish message landed on chain
    PublishConfirmed,
    /// Payload handed to the committing subsystem and placed in a slot
    Committed,
    /// Deal announced to indexers; resources released
    CommittedAndAnnounced,
    /// Terminal: slot finalized, or the deal failed
    Complete,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Accepted => "ACCEPTED",
            Checkpoint::Transferred => "TRANSFERRED",
            Checkpoint::Published => "PUBLISHED",
            Checkpoint::PublishConfirmed => "PUBLISH_CONFIRMED",
            Checkpoint::Committed => "COMMITTED",
            Checkpoint::CommittedAndAnnounced => "COMMITTED_AND_ANNOUNCED",
            Checkpoint::Complete => "COMPLETE",
        }
    }

    /// Check if this checkpoint can transition to another checkpoint.
    ///
    /// Forward by exactly one step, or straight to `Complete` on failure.
    /// Staying put is allowed so that re-persisting a deal is not a transition.
    pub fn can_transition_to(&self, target: Checkpoint) -> bool {
        use Checkpoint::*;

        if *self == target {
            return true;
        }

        match (self, target) {
            (Accepted, Transferred) => true,
            (Transferred, Published) => true,
            (Published, PublishConfirmed) => true,
            (PublishConfirmed, Committed) => true,
            (Committed, CommittedAndAnnounced) => true,
            (CommittedAndAnnounced, Complete) => true,

            // Failure from any live checkpoint
            (Accepted | Transferred | Published | PublishConfirmed | Committed, Complete) => true,

            _ => false,
        }
    }

    /// Get valid next checkpoints
    pub fn valid_transitions(&self) -> Vec<Checkpoint> {
        use Checkpoint::*;

        match self {
            Accepted => vec![Transferred, Complete],
            Transferred => vec![Published, Complete],
            Published => vec![PublishConfirmed, Complete],
            PublishConfirmed => vec![Committed, Complete],
            Committed => vec![CommittedAndAnnounced, Complete],
            CommittedAndAnnounced => vec![Complete],
            Complete => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Checkpoint::Complete)
    }

    /// Reservations must already be released once a deal gets here.
    pub fn resources_released(&self) -> bool {
        *self >= Checkpoint::CommittedAndAnnounced
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Checkpoint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "ACCEPTED" => Ok(Checkpoint::Accepted),
            "TRANSFERRED" => Ok(Checkpoint::Transferred),
            "PUBLISHED" => Ok(Checkpoint::Published),
            "PUBLISH_CONFIRMED" => Ok(Checkpoint::PublishConfirmed),
            "COMMITTED" => Ok(Checkpoint::Committed),
            "COMMITTED_AND_ANNOUNCED" => Ok(Checkpoint::CommittedAndAnnounced),
            "COMPLETE" => Ok(Checkpoint::Complete),
            _ => Err(format!("Unknown checkpoint: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Checkpoint; 7] = [
        Checkpoint::Accepted,
        Checkpoint::Transferred,
        Checkpoint::Published,
        Checkpoint::PublishConfirmed,
        Checkpoint::Committed,
        Checkpoint::CommittedAndAnnounced,
        Checkpoint::Complete,
    ];

    #[test]
    fn test_no_transition_moves_backwards() {
        for from in ALL {
            for to in ALL {
                if from.can_transition_to(to) {
                    assert!(to >= from, "{from} -> {to} regresses");
                }
            }
        }
    }

    #[test]
    fn test_valid_transitions_match_table() {
        for from in ALL {
            for to in from.valid_transitions() {
                assert!(from.can_transition_to(to), "{from} -> {to}");
            }
        }
        assert!(Checkpoint::Complete.valid_transitions().is_empty());
    }

    #[test]
    fn test_cannot_skip_steps() {
        assert!(!Checkpoint::Accepted.can_transition_to(Checkpoint::Published));
        assert!(!Checkpoint::Transferred.can_transition_to(Checkpoint::Committed));
        assert!(Checkpoint::Transferred.can_transition_to(Checkpoint::Complete));
    }

    #[test]
    fn test_round_trips_through_str() {
        for ckpt in ALL {
            assert_eq!(Checkpoint::try_from(ckpt.as_str()), Ok(ckpt));
        }
        assert!(Checkpoint::try_from("SEALING").is_err());
    }

    #[test]
    fn test_resources_released_from_announce_onwards() {
        assert!(!Checkpoint::Committed.resources_released());
        assert!(Checkpoint::CommittedAndAnnounced.resources_released());
        assert!(Checkpoint::Complete.resources_released());
    }
}
