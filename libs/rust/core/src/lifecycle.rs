//! Round and device-contribution state machines.
//!
//! Round phases:
//! - Pending
//! - Distributing
//! - Training
//! - Aggregating
//! - Completed
//!
//! `Failed` and `Cancelled` are reachable from every non-terminal phase. Exactly one
//! terminal phase is ever recorded for a round.

use std::fmt;
use std::time::{Duration, Instant};
use serde::{Serialize, Deserialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus { Pending, Distributing, Training, Aggregating, Completed, Failed, Cancelled }

impl RoundStatus {
    pub fn is_terminal(self) -> bool { matches!(self, RoundStatus::Completed | RoundStatus::Failed | RoundStatus::Cancelled) }

    pub fn can_transition_to(self, next: RoundStatus) -> bool {
        use RoundStatus::*;
        if self.is_terminal() { return false; }
        if self == next { return true; }
        match next {
            Failed | Cancelled => true,
            Distributing => self == Pending,
            Training => self == Distributing,
            Aggregating => self == Training,
            Completed => self == Aggregating,
            Pending => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Distributing => "distributing",
            RoundStatus::Training => "training",
            RoundStatus::Aggregating => "aggregating",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
            RoundStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus { Pending, Training, Uploading, Completed, Failed }

impl ContributionStatus {
    pub fn is_settled(self) -> bool { matches!(self, ContributionStatus::Completed | ContributionStatus::Failed) }
}

/// Tracks how long a session spent in each phase.
#[derive(Debug)]
pub struct PhaseClock {
    phase: RoundStatus,
    started_at: Instant,
    phase_started_at: Instant,
    phase_durations: Vec<(RoundStatus, Duration)>,
}

impl PhaseClock {
    pub fn new() -> Self { let now = Instant::now(); Self { phase: RoundStatus::Pending, started_at: now, phase_started_at: now, phase_durations: Vec::new() } }
    pub fn phase(&self) -> RoundStatus { self.phase }
    pub fn elapsed(&self) -> Duration { self.started_at.elapsed() }

    /// Moves to `next`, recording the time spent in the current phase. Illegal moves are ignored.
    pub fn advance(&mut self, next: RoundStatus) -> bool {
        if !self.phase.can_transition_to(next) || self.phase == next { return false; }
        let now = Instant::now();
        self.phase_durations.push((self.phase, now - self.phase_started_at));
        self.phase = next;
        self.phase_started_at = now;
        true
    }

    pub fn durations(&self) -> &[(RoundStatus, Duration)] { &self.phase_durations }
}

impl Default for PhaseClock { fn default() -> Self { Self::new() } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut clock = PhaseClock::new();
        for next in [RoundStatus::Distributing, RoundStatus::Training, RoundStatus::Aggregating, RoundStatus::Completed] {
            assert!(clock.advance(next));
        }
        assert_eq!(clock.phase(), RoundStatus::Completed);
        assert_eq!(clock.durations().len(), 4);
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(RoundStatus::Training.can_transition_to(RoundStatus::Cancelled));
        assert!(RoundStatus::Pending.can_transition_to(RoundStatus::Failed));
        assert!(!RoundStatus::Completed.can_transition_to(RoundStatus::Cancelled));
        assert!(!RoundStatus::Cancelled.can_transition_to(RoundStatus::Completed));
        assert!(!RoundStatus::Failed.can_transition_to(RoundStatus::Failed));
    }

    #[test]
    fn skipping_phases_is_rejected() {
        let mut clock = PhaseClock::new();
        assert!(!clock.advance(RoundStatus::Aggregating));
        assert_eq!(clock.phase(), RoundStatus::Pending);
        assert!(!RoundStatus::Training.can_transition_to(RoundStatus::Pending));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RoundStatus::Distributing).unwrap(), "\"distributing\"");
        assert_eq!(serde_json::to_string(&ContributionStatus::Uploading).unwrap(), "\"uploading\"");
    }
}
