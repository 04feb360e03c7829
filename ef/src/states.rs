//! Shared state taxonomy for tasks, stages and pipelines
//!
//! All three entity kinds walk the same forward ladder; `FAILED` is reachable
//! from any non-terminal state and `SUSPENDED` only applies to pipelines,
//! as a detour from `RUNNING`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Lifecycle state of a task, stage or pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Initial,
    Scheduling,
    Scheduled,
    Submitted,
    Running,
    Completing,
    Done,
    Failed,
    /// Pipeline-only: user-requested hold, reachable from `Running`
    Suspended,
}

impl State {
    /// Check whether no further transitions are expected
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed)
    }

    /// Position on the forward ladder; `Failed` ranks above everything,
    /// `Suspended` shares `Running`'s rung
    pub fn precedence(&self) -> u8 {
        match self {
            State::Initial => 0,
            State::Scheduling => 1,
            State::Scheduled => 2,
            State::Submitted => 3,
            State::Running | State::Suspended => 4,
            State::Completing => 5,
            State::Done => 6,
            State::Failed => 7,
        }
    }

    /// Check whether moving to `next` respects the ladder
    pub fn can_transition(&self, next: State) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, State::Failed) => true,
            (State::Running, State::Suspended) => true,
            (State::Suspended, State::Running) => true,
            (_, State::Suspended) => false,
            _ => next.precedence() > self.precedence(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Initial => "INITIAL",
            State::Scheduling => "SCHEDULING",
            State::Scheduled => "SCHEDULED",
            State::Submitted => "SUBMITTED",
            State::Running => "RUNNING",
            State::Completing => "COMPLETING",
            State::Done => "DONE",
            State::Failed => "FAILED",
            State::Suspended => "SUSPENDED",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for State {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIAL" => Ok(State::Initial),
            "SCHEDULING" => Ok(State::Scheduling),
            "SCHEDULED" => Ok(State::Scheduled),
            "SUBMITTED" => Ok(State::Submitted),
            "RUNNING" => Ok(State::Running),
            "COMPLETING" => Ok(State::Completing),
            "DONE" => Ok(State::Done),
            "FAILED" => Ok(State::Failed),
            "SUSPENDED" => Ok(State::Suspended),
            other => Err(EngineError::value(
                "state",
                format!("'{}' is not a known state", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(State::Done.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::Running.is_terminal());
        assert!(!State::Suspended.is_terminal());
    }

    #[test]
    fn test_forward_transitions() {
        assert!(State::Initial.can_transition(State::Scheduling));
        assert!(State::Scheduling.can_transition(State::Submitted));
        assert!(State::Completing.can_transition(State::Done));
        assert!(!State::Running.can_transition(State::Initial));
        assert!(!State::Done.can_transition(State::Failed));
    }

    #[test]
    fn test_failure_from_any_nonterminal() {
        for state in [
            State::Initial,
            State::Scheduling,
            State::Scheduled,
            State::Submitted,
            State::Running,
            State::Completing,
            State::Suspended,
        ] {
            assert!(state.can_transition(State::Failed), "{state} -> FAILED");
        }
        assert!(!State::Failed.can_transition(State::Failed));
    }

    #[test]
    fn test_suspension_detour() {
        assert!(State::Running.can_transition(State::Suspended));
        assert!(State::Suspended.can_transition(State::Running));
        assert!(!State::Initial.can_transition(State::Suspended));
        assert!(!State::Scheduled.can_transition(State::Suspended));
    }

    #[test]
    fn test_display_roundtrip() {
        for state in [
            State::Initial,
            State::Scheduling,
            State::Scheduled,
            State::Submitted,
            State::Running,
            State::Completing,
            State::Done,
            State::Failed,
            State::Suspended,
        ] {
            let rendered = state.to_string();
            assert_eq!(rendered.parse::<State>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_is_value_error() {
        let err = "WAITING".parse::<State>().unwrap_err();
        assert!(matches!(err, EngineError::Value { .. }));
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&State::Scheduling).unwrap();
        assert_eq!(json, "\"SCHEDULING\"");
        let back: State = serde_json::from_str("\"DONE\"").unwrap();
        assert_eq!(back, State::Done);
    }
}
