//! Per-request state machine.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    Classifying,
    Rejected,
    RateLimited,
    Executing,
    Succeeded,
    Failed,
    TimedOut,
    Audited,
    Done,
}

impl RequestState {
    /// Allowed edges. `Received`, `Classifying` and `Executing` may jump
    /// straight to `Audited` when the request is abandoned.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Classifying | Rejected | Audited)
                | (Classifying, Rejected | RateLimited | Executing | Audited)
                | (Executing, Succeeded | Failed | TimedOut | Audited)
                | (Rejected | RateLimited | Succeeded | Failed | TimedOut, Audited)
                | (Audited, Done)
        )
    }

    /// States after which only auditing remains.
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::RateLimited | Self::Succeeded | Self::Failed | Self::TimedOut
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid request transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RequestState,
    pub to: RequestState,
}

/// Tracks the state of one request and the path it took.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    trail: Vec<RequestState>,
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self {
            trail: vec![RequestState::Received],
        }
    }
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RequestState {
        // The trail always starts with Received.
        self.trail.last().copied().unwrap_or(RequestState::Received)
    }

    pub fn advance(&mut self, next: RequestState) -> Result<(), InvalidTransition> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.trail.push(next);
        Ok(())
    }

    pub fn trail(&self) -> &[RequestState] {
        &self.trail
    }

    pub fn is_audited(&self) -> bool {
        matches!(self.state(), RequestState::Audited | RequestState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RequestState::*;

    #[test]
    fn test_happy_path() {
        let mut lifecycle = RequestLifecycle::new();
        for state in [Classifying, Executing, Succeeded, Audited, Done] {
            lifecycle.advance(state).unwrap();
        }
        assert_eq!(
            lifecycle.trail(),
            &[Received, Classifying, Executing, Succeeded, Audited, Done]
        );
    }

    #[test]
    fn test_invalid_limit_path() {
        let mut lifecycle = RequestLifecycle::new();
        lifecycle.advance(Rejected).unwrap();
        lifecycle.advance(Audited).unwrap();
        assert!(lifecycle.is_audited());
    }

    #[test]
    fn test_rejects_skipping_classification() {
        let mut lifecycle = RequestLifecycle::new();
        let err = lifecycle.advance(Executing).unwrap_err();
        assert_eq!(err, InvalidTransition { from: Received, to: Executing });
        assert_eq!(lifecycle.state(), Received);
    }

    #[test]
    fn test_no_double_audit() {
        let mut lifecycle = RequestLifecycle::new();
        lifecycle.advance(Classifying).unwrap();
        lifecycle.advance(RateLimited).unwrap();
        lifecycle.advance(Audited).unwrap();
        assert!(lifecycle.advance(Audited).is_err());
        assert!(lifecycle.advance(Done).is_ok());
        assert!(lifecycle.advance(Classifying).is_err());
    }

    #[test]
    fn test_outcomes() {
        assert!(TimedOut.is_outcome());
        assert!(!Executing.is_outcome());
    }
}
