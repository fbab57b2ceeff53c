//! Loop states, events and the transition table
//!
//! `transition` is a pure function of (state, event); the driver in the
//! parent module performs the I/O and feeds the resulting events back in.

use crate::error::ResearchError;
use crate::models::StopReason;
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopState {
    Planning,
    Executing,
    Validating,
    Reflecting,
    Synthesizing(StopReason),
    Done(StopReason),
    Aborted(String),
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Planning => "planning",
            LoopState::Executing => "executing",
            LoopState::Validating => "validating",
            LoopState::Reflecting => "reflecting",
            LoopState::Synthesizing(_) => "synthesizing",
            LoopState::Done(_) => "done",
            LoopState::Aborted(_) => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Done(_) | LoopState::Aborted(_))
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the Reflecting phase observed after a wave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reflection {
    pub all_satisfied: bool,
    /// Permanent failures only, nothing usable gathered, nothing left to try.
    pub dead_end: bool,
    pub cancelled: bool,
    pub budget_exhausted: bool,
    pub stalled: bool,
}

impl Reflection {
    fn decide(&self) -> LoopState {
        if self.all_satisfied {
            LoopState::Synthesizing(StopReason::Completed)
        } else if self.dead_end {
            LoopState::Aborted("a permanent failure left no usable data".to_string())
        } else if self.cancelled {
            LoopState::Synthesizing(StopReason::Cancelled)
        } else if self.budget_exhausted {
            LoopState::Synthesizing(StopReason::BudgetExhausted)
        } else if self.stalled {
            LoopState::Synthesizing(StopReason::Stalled)
        } else {
            LoopState::Planning
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    // === Planning ===
    /// At least one task was admitted into the next wave.
    PlanReady,
    PlanExhausted { usable_artifacts: bool },
    PlannerFailed(String),
    BudgetExhausted,
    Cancelled,

    // === Executing / Validating ===
    WaveSettled,
    Validated,

    // === Reflecting ===
    Reflected(Reflection),

    // === Synthesizing ===
    Synthesized,
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoopEvent::PlanReady => "plan_ready",
            LoopEvent::PlanExhausted { .. } => "plan_exhausted",
            LoopEvent::PlannerFailed(_) => "planner_failed",
            LoopEvent::BudgetExhausted => "budget_exhausted",
            LoopEvent::Cancelled => "cancelled",
            LoopEvent::WaveSettled => "wave_settled",
            LoopEvent::Validated => "validated",
            LoopEvent::Reflected(_) => "reflected",
            LoopEvent::Synthesized => "synthesized",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event '{event}' is not valid in state '{state}'")]
pub struct TransitionError {
    pub state: &'static str,
    pub event: &'static str,
}

impl From<TransitionError> for ResearchError {
    fn from(err: TransitionError) -> Self {
        ResearchError::InvalidTransition(err.to_string())
    }
}

pub fn transition(state: &LoopState, event: LoopEvent) -> Result<LoopState, TransitionError> {
    use LoopEvent as E;
    use LoopState as S;

    let next = match (state, event) {
        (S::Planning, E::PlanReady) => S::Executing,
        (S::Planning, E::PlanExhausted { usable_artifacts: true }) => {
            S::Synthesizing(StopReason::PlanExhausted)
        }
        (S::Planning, E::PlanExhausted { usable_artifacts: false }) => {
            S::Aborted("no dispatchable tasks and no usable data".to_string())
        }
        (S::Planning, E::PlannerFailed(reason)) => S::Aborted(reason),
        (S::Planning, E::BudgetExhausted) => S::Synthesizing(StopReason::BudgetExhausted),
        (S::Planning, E::Cancelled) => S::Synthesizing(StopReason::Cancelled),

        (S::Executing, E::WaveSettled) => S::Validating,
        (S::Validating, E::Validated) => S::Reflecting,
        (S::Reflecting, E::Reflected(reflection)) => reflection.decide(),

        (S::Synthesizing(reason), E::Synthesized) => S::Done(*reason),

        (state, event) => {
            return Err(TransitionError {
                state: state.name(),
                event: event.name(),
            })
        }
    };

    Ok(next)
}

/// Per-digest dispatch counter.
///
/// A digest's count resets the first time it produces a satisfied result;
/// any digest dispatched more than `threshold` times without that trips the
/// detector for the rest of the run.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    threshold: u32,
    counts: HashMap<String, u32>,
    satisfied: HashSet<String>,
    tripped: bool,
}

impl LoopDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
            satisfied: HashSet::new(),
            tripped: false,
        }
    }

    /// Returns true if this dispatch tripped the detector.
    pub fn record(&mut self, digest: &str, satisfied: bool) -> bool {
        if satisfied && self.satisfied.insert(digest.to_string()) {
            self.counts.remove(digest);
            return false;
        }

        let count = self.counts.entry(digest.to_string()).or_insert(0);
        *count += 1;

        if *count > self.threshold && !self.tripped {
            self.tripped = true;
            return true;
        }
        false
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn count(&self, digest: &str) -> u32 {
        self.counts.get(digest).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = LoopState::Planning;
        for event in [
            LoopEvent::PlanReady,
            LoopEvent::WaveSettled,
            LoopEvent::Validated,
            LoopEvent::Reflected(Reflection {
                all_satisfied: true,
                ..Reflection::default()
            }),
            LoopEvent::Synthesized,
        ] {
            state = transition(&state, event).unwrap();
        }
        assert_eq!(state, LoopState::Done(StopReason::Completed));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_reflection_priorities() {
        let decide = |r: Reflection| transition(&LoopState::Reflecting, LoopEvent::Reflected(r));

        assert_eq!(decide(Reflection::default()).unwrap(), LoopState::Planning);
        assert!(matches!(
            decide(Reflection {
                dead_end: true,
                cancelled: true,
                ..Reflection::default()
            })
            .unwrap(),
            LoopState::Aborted(_)
        ));
        assert_eq!(
            decide(Reflection {
                cancelled: true,
                budget_exhausted: true,
                ..Reflection::default()
            })
            .unwrap(),
            LoopState::Synthesizing(StopReason::Cancelled)
        );
        assert_eq!(
            decide(Reflection {
                budget_exhausted: true,
                stalled: true,
                ..Reflection::default()
            })
            .unwrap(),
            LoopState::Synthesizing(StopReason::BudgetExhausted)
        );
        assert_eq!(
            decide(Reflection {
                stalled: true,
                ..Reflection::default()
            })
            .unwrap(),
            LoopState::Synthesizing(StopReason::Stalled)
        );
    }

    #[test]
    fn test_planning_exits() {
        let planning = LoopState::Planning;
        assert_eq!(
            transition(&planning, LoopEvent::PlanExhausted { usable_artifacts: true }).unwrap(),
            LoopState::Synthesizing(StopReason::PlanExhausted)
        );
        assert!(matches!(
            transition(&planning, LoopEvent::PlanExhausted { usable_artifacts: false }).unwrap(),
            LoopState::Aborted(_)
        ));
        assert_eq!(
            transition(&planning, LoopEvent::PlannerFailed("no ticker".into())).unwrap(),
            LoopState::Aborted("no ticker".into())
        );
        assert_eq!(
            transition(&planning, LoopEvent::BudgetExhausted).unwrap(),
            LoopState::Synthesizing(StopReason::BudgetExhausted)
        );
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let err = transition(&LoopState::Executing, LoopEvent::PlanReady).unwrap_err();
        assert_eq!(err.state, "executing");
        assert_eq!(err.event, "plan_ready");

        assert!(transition(&LoopState::Done(StopReason::Completed), LoopEvent::Synthesized).is_err());
        assert!(transition(&LoopState::Aborted("x".into()), LoopEvent::PlanReady).is_err());

        let research: ResearchError = err.into();
        assert!(matches!(research, ResearchError::InvalidTransition(_)));
    }

    #[test]
    fn test_loop_detector_trips_past_threshold() {
        let mut detector = LoopDetector::new(2);
        assert!(!detector.record("a", false));
        assert!(!detector.record("a", false));
        assert!(detector.record("a", false));
        assert!(detector.is_tripped());
        // only reported once
        assert!(!detector.record("a", false));
    }

    #[test]
    fn test_loop_detector_resets_on_first_success() {
        let mut detector = LoopDetector::new(2);
        detector.record("a", false);
        detector.record("a", false);
        assert!(!detector.record("a", true));
        assert_eq!(detector.count("a"), 0);

        // repeat dispatches of an already satisfied digest still count
        detector.record("a", true);
        detector.record("a", true);
        assert!(detector.record("a", true));
    }
}
