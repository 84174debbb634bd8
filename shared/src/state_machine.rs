//! Control Mode State Machine
//!
//! Decides between manual and autonomous control for one session.
//! Side effects (starting frame analysis, issuing STOP) belong to the caller;
//! this type only reports which transition happened.

use crate::ControlMode;

/// Events that can trigger mode transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    /// Operator pressed the mode button
    LocalToggle,
    /// A value arrived on the session's `ai_mode` topic
    RemoteSet(ControlMode),
    /// The owning session is being torn down
    SessionClosed,
}

/// Result of processing a mode event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// State changed
    Entered { from: ControlMode, to: ControlMode },
    /// Event was a no-op in the current state
    Unchanged(ControlMode),
    /// Session already closed, event ignored
    Closed,
}

impl TransitionResult {
    pub fn entered(&self) -> Option<ControlMode> {
        match self {
            TransitionResult::Entered { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Mode state machine for one session
#[derive(Debug, Default)]
pub struct ModeStateMachine {
    current: ControlMode,
    closed: bool,
}

impl ModeStateMachine {
    /// Create a new state machine in manual mode
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ControlMode {
        self.current
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: ModeEvent) -> TransitionResult {
        if self.closed {
            return TransitionResult::Closed;
        }

        let next = match event {
            ModeEvent::LocalToggle => self.current.toggled(),
            ModeEvent::RemoteSet(mode) => mode,
            ModeEvent::SessionClosed => {
                self.closed = true;
                ControlMode::Manual
            }
        };

        if next == self.current {
            return TransitionResult::Unchanged(self.current);
        }

        let from = self.current;
        self.current = next;
        TransitionResult::Entered { from, to: next }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = ModeStateMachine::new();
        assert_eq!(fsm.mode(), ControlMode::Manual);
        assert!(!fsm.is_closed());
    }

    #[test]
    fn test_local_toggle_flips() {
        let mut fsm = ModeStateMachine::new();

        let result = fsm.process_event(ModeEvent::LocalToggle);
        assert_eq!(
            result,
            TransitionResult::Entered {
                from: ControlMode::Manual,
                to: ControlMode::Autonomous
            }
        );

        let result = fsm.process_event(ModeEvent::LocalToggle);
        assert_eq!(result.entered(), Some(ControlMode::Manual));
    }

    #[test]
    fn test_remote_set_is_idempotent() {
        let mut fsm = ModeStateMachine::new();

        let result = fsm.process_event(ModeEvent::RemoteSet(ControlMode::Autonomous));
        assert_eq!(result.entered(), Some(ControlMode::Autonomous));

        let result = fsm.process_event(ModeEvent::RemoteSet(ControlMode::Autonomous));
        assert_eq!(result, TransitionResult::Unchanged(ControlMode::Autonomous));

        let result = fsm.process_event(ModeEvent::RemoteSet(ControlMode::Manual));
        assert_eq!(result.entered(), Some(ControlMode::Manual));
    }

    #[test]
    fn test_close_forces_manual_and_is_terminal() {
        let mut fsm = ModeStateMachine::new();
        fsm.process_event(ModeEvent::LocalToggle);

        let result = fsm.process_event(ModeEvent::SessionClosed);
        assert_eq!(result.entered(), Some(ControlMode::Manual));
        assert!(fsm.is_closed());

        assert_eq!(
            fsm.process_event(ModeEvent::LocalToggle),
            TransitionResult::Closed
        );
        assert_eq!(fsm.mode(), ControlMode::Manual);
    }

    #[test]
    fn test_close_from_manual_is_unchanged() {
        let mut fsm = ModeStateMachine::new();
        let result = fsm.process_event(ModeEvent::SessionClosed);
        assert_eq!(result, TransitionResult::Unchanged(ControlMode::Manual));
        assert!(fsm.is_closed());
    }
}
