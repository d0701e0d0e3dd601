//! Submission lifecycle.
use crate::NfseError;
use std::fmt;

/// Stage of a single client call.
///
/// ```text
/// Idle -> Building -> Signing -> Encoding -> Submitting -> AwaitingResponse -> Completed
///                                               ^                |
///                                               +---- retry -----+
/// ```
/// `Failed` is reachable from every non-terminal state. Read-only calls
/// (query, DANFSe download) walk the document stages without work; no stage
/// is ever skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmissionState {
    Idle,
    Building,
    Signing,
    Encoding,
    Submitting,
    AwaitingResponse,
    Completed,
    Failed,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionState::Completed | SubmissionState::Failed)
    }

    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Building) => true,
            (Building, Signing) => true,
            (Signing, Encoding) => true,
            (Encoding, Submitting) => true,
            (Submitting, AwaitingResponse) => true,
            (AwaitingResponse, Submitting) => true,
            (AwaitingResponse, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionState::Idle => "idle",
            SubmissionState::Building => "building",
            SubmissionState::Signing => "signing",
            SubmissionState::Encoding => "encoding",
            SubmissionState::Submitting => "submitting",
            SubmissionState::AwaitingResponse => "awaiting_response",
            SubmissionState::Completed => "completed",
            SubmissionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-call state holder. Never shared between calls.
#[derive(Debug)]
pub(crate) struct StateMachine {
    operation: &'static str,
    state: SubmissionState,
}

impl StateMachine {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            state: SubmissionState::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SubmissionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: SubmissionState) -> Result<(), NfseError> {
        if !self.state.can_transition_to(next) {
            return Err(NfseError::ClientState(format!(
                "{}: invalid transition {} -> {}",
                self.operation, self.state, next
            )));
        }
        tracing::debug!(operation = self.operation, from = %self.state, to = %next, "state transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal.
    pub(crate) fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!(operation = self.operation, from = %self.state, "state transition to failed");
            self.state = SubmissionState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SubmissionState::*;
    use super::*;

    #[test]
    fn happy_path_with_retry() {
        let mut machine = StateMachine::new("issue");
        for next in [
            Building,
            Signing,
            Encoding,
            Submitting,
            AwaitingResponse,
            Submitting,
            AwaitingResponse,
            Completed,
        ] {
            machine.advance(next).expect("transition");
        }
        assert_eq!(machine.state(), Completed);
    }

    #[test]
    fn skipping_stages_is_a_client_state_error() {
        let mut machine = StateMachine::new("issue");
        machine.advance(Building).expect("transition");
        let err = machine.advance(Submitting).expect_err("must not skip signing");
        assert!(matches!(err, NfseError::ClientState(ref msg) if msg.contains("building -> submitting")));
        assert_eq!(machine.state(), Building);
    }

    #[test]
    fn idle_cannot_jump_to_submitting() {
        assert!(!Idle.can_transition_to(Submitting));
        assert!(!Idle.can_transition_to(AwaitingResponse));
        let mut machine = StateMachine::new("query");
        assert!(machine.advance(Submitting).is_err());
        assert_eq!(machine.state(), Idle);
    }

    #[test]
    fn completed_only_after_response() {
        assert!(!Submitting.can_transition_to(Completed));
        assert!(!Encoding.can_transition_to(Completed));
        assert!(AwaitingResponse.can_transition_to(Completed));
    }

    #[test]
    fn failed_is_reachable_from_any_live_state() {
        for state in [Idle, Building, Signing, Encoding, Submitting, AwaitingResponse] {
            assert!(state.can_transition_to(Failed), "{state}");
        }
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Submitting));
    }

    #[test]
    fn fail_is_idempotent_on_terminal_states() {
        let mut machine = StateMachine::new("query");
        machine.advance(Building).expect("transition");
        machine.fail();
        machine.fail();
        assert_eq!(machine.state(), Failed);
    }
}
