//! Session state machine shared by the loops and the control surface.

use crate::errors::ControlError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Stopped,
    Running,
    Halted,
    Liquidating,
    Liquidated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Stopped => "STOPPED",
            SessionState::Running => "RUNNING",
            SessionState::Halted => "HALTED",
            SessionState::Liquidating => "LIQUIDATING",
            SessionState::Liquidated => "LIQUIDATED",
        };
        f.write_str(s)
    }
}

/// Cloneable handle; every transition is a single atomic check-and-set.
#[derive(Clone)]
pub struct SessionControl {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Stopped);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Move to `to` if the current state satisfies `allowed`.
    fn transition(
        &self,
        action: &'static str,
        to: SessionState,
        allowed: impl FnOnce(SessionState) -> bool,
    ) -> Result<SessionState, ControlError> {
        let mut outcome = Err(ControlError::InvalidTransition {
            action,
            state: String::new(),
        });
        self.tx.send_if_modified(|state| {
            let from = *state;
            if allowed(from) {
                *state = to;
                outcome = Ok(from);
                from != to
            } else {
                outcome = Err(ControlError::InvalidTransition {
                    action,
                    state: from.to_string(),
                });
                false
            }
        });
        if let Ok(from) = &outcome {
            info!(%from, %to, action, "Session transition");
        }
        outcome
    }

    /// STOPPED or LIQUIDATED -> RUNNING.
    pub fn start(&self) -> Result<(), ControlError> {
        self.transition("start", SessionState::Running, |s| {
            matches!(s, SessionState::Stopped | SessionState::Liquidated)
        })
        .map(|_| ())
    }

    /// Anything but LIQUIDATING -> STOPPED.
    pub fn stop(&self) -> Result<(), ControlError> {
        self.transition("stop", SessionState::Stopped, |s| {
            s != SessionState::Liquidating
        })
        .map(|_| ())
    }

    /// RUNNING -> HALTED (idempotent while HALTED).
    pub fn halt(&self) -> Result<(), ControlError> {
        self.transition("halt", SessionState::Halted, |s| {
            matches!(s, SessionState::Running | SessionState::Halted)
        })
        .map(|_| ())
    }

    /// HALTED -> RUNNING only.
    pub fn resume(&self) -> Result<(), ControlError> {
        self.transition("resume", SessionState::Running, |s| s == SessionState::Halted)
            .map(|_| ())
    }

    /// Enter LIQUIDATING. Returns false if a liquidation is already underway
    /// or finished, in which case nothing changes.
    pub fn begin_liquidation(&self) -> bool {
        self.transition("liquidate", SessionState::Liquidating, |s| {
            !matches!(s, SessionState::Liquidating | SessionState::Liquidated)
        })
        .is_ok()
    }

    /// LIQUIDATING -> LIQUIDATED.
    pub fn mark_liquidated(&self) -> bool {
        self.transition("complete liquidation", SessionState::Liquidated, |s| {
            s == SessionState::Liquidating
        })
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_resume_cycle() {
        let session = SessionControl::new();
        assert!(session.halt().is_err());
        session.start().unwrap();
        session.halt().unwrap();
        session.halt().unwrap();
        assert_eq!(session.state(), SessionState::Halted);
        session.resume().unwrap();
        assert!(session.is_running());
    }

    #[test]
    fn test_resume_only_from_halted() {
        let session = SessionControl::new();
        session.start().unwrap();
        let err = session.resume().unwrap_err();
        assert_eq!(err.to_string(), "cannot resume while session is RUNNING");
    }

    #[test]
    fn test_liquidation_is_idempotent() {
        let session = SessionControl::new();
        session.start().unwrap();
        assert!(session.begin_liquidation());
        assert!(!session.begin_liquidation());
        assert!(session.halt().is_err());
        assert!(session.resume().is_err());
        assert!(session.stop().is_err());
        assert!(session.mark_liquidated());
        assert!(!session.begin_liquidation());
        assert_eq!(session.state(), SessionState::Liquidated);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let session = SessionControl::new();
        let rx = session.subscribe();
        session.start().unwrap();
        assert_eq!(*rx.borrow(), SessionState::Running);
    }
}
