//! Aggregation of probe outcomes.
//!
//! Two independent reductions over the same [`ProbeOutcome`] type: the coarse
//! path produces a persisted [`HealthSample`](crate::db::HealthSample), the
//! fine path a throwaway [`BadgeState`].

mod badge;
mod sample;

pub use badge::*;
pub use sample::*;

use crate::probe::ProbeOutcome;

/// Reachable and total attempt counts of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTally {
    pub reachable: usize,
    pub total: usize,
}

impl RoundTally {
    pub fn of(outcomes: &[ProbeOutcome]) -> Self {
        Self {
            reachable: outcomes.iter().filter(|o| o.reachable).count(),
            total: outcomes.len(),
        }
    }

    pub fn unreachable(&self) -> usize {
        self.total - self.reachable
    }
}
