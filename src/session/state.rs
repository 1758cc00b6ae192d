//! Per-turn state machine.
//!
//! ```text
//! IDLE ─▶ RECEIVING ─▶ TRANSCRIBING ─▶ GENERATING ─▶ SYNTHESIZING ─▶ COMPLETE
//!                           │                                           ▲
//!                           └──────────── empty transcription ──────────┘
//! ```
//!
//! `ERROR` is reachable from every non-terminal state. `COMPLETE` and `ERROR`
//! are terminal.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Receiving,
    Transcribing,
    Generating,
    Synthesizing,
    Complete,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Receiving => "RECEIVING",
            SessionState::Transcribing => "TRANSCRIBING",
            SessionState::Generating => "GENERATING",
            SessionState::Synthesizing => "SYNTHESIZING",
            SessionState::Complete => "COMPLETE",
            SessionState::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Error)
    }

    /// Past reassembly and not yet terminal
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            SessionState::Transcribing | SessionState::Generating | SessionState::Synthesizing
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (Idle, Receiving)
            | (Receiving, Transcribing)
            | (Transcribing, Generating)
            | (Transcribing, Complete)
            | (Generating, Synthesizing)
            | (Synthesizing, Complete) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid state transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Current state plus every state visited this turn
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: SessionState,
    history: Vec<SessionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `ERROR` unless already terminal. Returns whether it moved.
    pub fn fail(&mut self) -> bool {
        self.transition(SessionState::Error).is_ok()
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.history.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 7] = [
        Idle,
        Receiving,
        Transcribing,
        Generating,
        Synthesizing,
        Complete,
        Error,
    ];

    #[test]
    fn test_happy_path() {
        let mut machine = StateMachine::new();
        for next in [Receiving, Transcribing, Generating, Synthesizing, Complete] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.state(), Complete);
        assert_eq!(machine.history().len(), 6);
    }

    #[test]
    fn test_skip_generation_path() {
        let mut machine = StateMachine::new();
        machine.transition(Receiving).unwrap();
        machine.transition(Transcribing).unwrap();
        machine.transition(Complete).unwrap();
        assert!(machine.visited(Transcribing));
        assert!(!machine.visited(Generating));
    }

    #[test]
    fn test_error_reachable_from_non_terminal_only() {
        for from in ALL {
            assert_eq!(from.can_transition_to(Error), !from.is_terminal(), "{from}");
        }
        let mut machine = StateMachine::new();
        assert!(machine.fail());
        assert!(!machine.fail());
        assert_eq!(machine.state(), Error);
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Idle.can_transition_to(Transcribing));
        assert!(!Receiving.can_transition_to(Generating));
        assert!(!Receiving.can_transition_to(Complete));
        assert!(!Generating.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Idle));

        let mut machine = StateMachine::new();
        let err = machine.transition(Generating).unwrap_err();
        assert_eq!(err.from, Idle);
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn test_complete_requires_transcribing() {
        // Every path into COMPLETE passes TRANSCRIBING
        for from in ALL {
            if from.can_transition_to(Complete) {
                assert!(matches!(from, Transcribing | Synthesizing));
            }
        }
    }
}
