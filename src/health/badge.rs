//! Live status badge classification.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::RoundTally;
use crate::probe::ProbeOutcome;

/// At-a-glance uplink state. Recomputed every fine cycle, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BadgeState {
    Up,
    PartiallyUp,
    Down,
    Unknown,
}

impl BadgeState {
    pub fn label(&self) -> &'static str {
        match self {
            BadgeState::Up => "Internet: Up",
            BadgeState::PartiallyUp => "Internet: Partially Up",
            BadgeState::Down => "Internet: Down",
            BadgeState::Unknown => "Internet: Unknown",
        }
    }

    pub fn from_tally(tally: RoundTally) -> Self {
        if tally.total == 0 {
            BadgeState::Unknown
        } else if tally.reachable == tally.total {
            BadgeState::Up
        } else if tally.reachable == 0 {
            BadgeState::Down
        } else {
            BadgeState::PartiallyUp
        }
    }
}

/// Latest fine-cycle result as published to readers.
#[derive(Debug, Clone, Serialize)]
pub struct BadgeReport {
    pub state: BadgeState,
    pub label: &'static str,
    pub checked_at: Option<DateTime<Utc>>,
}

impl BadgeReport {
    pub fn new(state: BadgeState, checked_at: DateTime<Utc>) -> Self {
        Self {
            state,
            label: state.label(),
            checked_at: Some(checked_at),
        }
    }

    /// Placeholder before the first fine cycle has run.
    pub fn pending() -> Self {
        Self {
            state: BadgeState::Unknown,
            label: BadgeState::Unknown.label(),
            checked_at: None,
        }
    }
}

/// Classify one fine-cycle round.
pub fn classify(outcomes: &[ProbeOutcome]) -> BadgeState {
    BadgeState::from_tally(RoundTally::of(outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn round(reachable: usize, total: usize) -> Vec<ProbeOutcome> {
        (0..total)
            .map(|i| {
                if i < reachable {
                    ProbeOutcome::reachable("t", Duration::from_millis(10))
                } else {
                    ProbeOutcome::unreachable("t")
                }
            })
            .collect()
    }

    #[test]
    fn test_classify_thresholds() {
        assert_eq!(classify(&round(3, 3)), BadgeState::Up);
        assert_eq!(classify(&round(2, 3)), BadgeState::PartiallyUp);
        assert_eq!(classify(&round(1, 3)), BadgeState::PartiallyUp);
        assert_eq!(classify(&round(0, 3)), BadgeState::Down);
        assert_eq!(classify(&[]), BadgeState::Unknown);
    }

    #[test]
    fn test_classify_is_total_for_nonempty_rounds() {
        for total in 1..=12 {
            for reachable in 0..=total {
                let state = classify(&round(reachable, total));
                let expected = match reachable {
                    0 => BadgeState::Down,
                    r if r == total => BadgeState::Up,
                    _ => BadgeState::PartiallyUp,
                };
                assert_eq!(state, expected, "{}/{}", reachable, total);
            }
        }
    }

    #[test]
    fn test_near_complete_round_is_not_up() {
        // 199/200 rounds to 100% but is still a partial outage
        assert_eq!(classify(&round(199, 200)), BadgeState::PartiallyUp);
    }
}
