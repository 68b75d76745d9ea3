//! Build pipeline state machine.
//!
//! `Created → Provisioning → Cloned → Configured → Running → Reported → Done`,
//! with `Errored` reachable from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    Provisioning,
    Cloned,
    Configured,
    Running,
    Reported,
    Done,
    Errored,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Provisioning => "provisioning",
            PipelineState::Cloned => "cloned",
            PipelineState::Configured => "configured",
            PipelineState::Running => "running",
            PipelineState::Reported => "reported",
            PipelineState::Done => "done",
            PipelineState::Errored => "errored",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "created" => PipelineState::Created,
            "provisioning" => PipelineState::Provisioning,
            "cloned" => PipelineState::Cloned,
            "configured" => PipelineState::Configured,
            "running" => PipelineState::Running,
            "reported" => PipelineState::Reported,
            "done" => PipelineState::Done,
            "errored" => PipelineState::Errored,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Errored)
    }

    fn successor(self) -> Option<Self> {
        match self {
            PipelineState::Created => Some(PipelineState::Provisioning),
            PipelineState::Provisioning => Some(PipelineState::Cloned),
            PipelineState::Cloned => Some(PipelineState::Configured),
            PipelineState::Configured => Some(PipelineState::Running),
            PipelineState::Running => Some(PipelineState::Reported),
            PipelineState::Reported => Some(PipelineState::Done),
            PipelineState::Done | PipelineState::Errored => None,
        }
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == PipelineState::Errored || self.successor() == Some(next)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid pipeline transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: PipelineState,
    pub to: PipelineState,
}

/// State of one pipeline run plus the history it went through.
#[derive(Debug, Clone)]
pub struct BuildLifecycle {
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for BuildLifecycle {
    fn default() -> Self {
        Self {
            state: PipelineState::Created,
            history: vec![PipelineState::Created],
        }
    }
}

impl BuildLifecycle {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<PipelineState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_every_state() {
        let mut lifecycle = BuildLifecycle::default();
        for next in [
            PipelineState::Provisioning,
            PipelineState::Cloned,
            PipelineState::Configured,
            PipelineState::Running,
            PipelineState::Reported,
            PipelineState::Done,
        ] {
            lifecycle.advance(next).unwrap();
        }
        assert_eq!(lifecycle.state(), PipelineState::Done);
        assert_eq!(lifecycle.history().len(), 7);
    }

    #[test]
    fn errored_is_reachable_from_any_non_terminal_state() {
        for state in [
            PipelineState::Created,
            PipelineState::Provisioning,
            PipelineState::Cloned,
            PipelineState::Configured,
            PipelineState::Running,
            PipelineState::Reported,
        ] {
            assert!(state.can_transition_to(PipelineState::Errored), "{state}");
        }
        assert!(!PipelineState::Done.can_transition_to(PipelineState::Errored));
        assert!(!PipelineState::Errored.can_transition_to(PipelineState::Errored));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut lifecycle = BuildLifecycle::default();
        let err = lifecycle.advance(PipelineState::Running).unwrap_err();
        assert_eq!(err.from, PipelineState::Created);
        assert_eq!(lifecycle.state(), PipelineState::Created);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            PipelineState::Created,
            PipelineState::Provisioning,
            PipelineState::Cloned,
            PipelineState::Configured,
            PipelineState::Running,
            PipelineState::Reported,
            PipelineState::Done,
            PipelineState::Errored,
        ] {
            assert_eq!(PipelineState::parse(state.as_str()), Some(state));
        }
        assert_eq!(PipelineState::parse("pending"), None);
    }
}
