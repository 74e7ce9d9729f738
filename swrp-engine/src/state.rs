//! Pipeline state machine (C6): the states and legal transitions shared by
//! both the source and sink endpoints, plus the observer notification that
//! every transition triggers.

use crate::error::{Error, Result};
use std::sync::Mutex;

/// A pipeline lifecycle state, shared by source and sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Disconnected,
    Connecting,
    Connected,
    Handshaking,
    Ready,
    Starting,
    Streaming,
    Stopping,
    Error,
}

impl PipelineState {
    /// Whether transitioning from `self` to `next` is in the legal table of
    /// §4.6.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Error)
                | (Connected, Handshaking)
                | (Connected, Disconnected)
                | (Connected, Error)
                | (Handshaking, Ready)
                | (Handshaking, Disconnected)
                | (Handshaking, Error)
                | (Ready, Starting)
                | (Ready, Disconnected)
                | (Ready, Error)
                | (Starting, Streaming)
                | (Starting, Ready)
                | (Starting, Disconnected)
                | (Starting, Error)
                | (Streaming, Stopping)
                | (Streaming, Disconnected)
                | (Streaming, Error)
                | (Stopping, Ready)
                | (Stopping, Disconnected)
                | (Stopping, Error)
                | (Error, Disconnected)
                | (Error, Connecting)
        )
    }
}

/// An observer notified on every legal transition. Registered callbacks are
/// invoked synchronously by whichever task drives the transition; the
/// pipeline holds no back-pointer to its observers beyond this list (see
/// `DESIGN.md` on the one-way-channel observer shape).
pub type StateObserver = Box<dyn Fn(PipelineState, PipelineState) + Send + Sync>;

/// Owns the current [`PipelineState`] and enforces the legal-transition
/// table. Shared between the pipeline's cooperating tasks behind a mutex —
/// transitions are instantaneous and never a suspension point (§5).
pub struct StateMachine {
    state: Mutex<PipelineState>,
    observers: Mutex<Vec<StateObserver>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Disconnected),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a callback invoked with `(from, to)` on every transition.
    pub fn observe(&self, observer: StateObserver) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Returns the current state.
    pub fn current(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    /// Attempts a transition. Fails with [`Error::IllegalTransition`] if
    /// `next` is not reachable from the current state; observers are not
    /// notified in that case.
    pub fn transition(&self, next: PipelineState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: *state,
                to: next,
            });
        }
        let prev = *state;
        *state = next;
        drop(state);

        for observer in self.observers.lock().unwrap().iter() {
            observer(prev, next);
        }
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn legal_path_through_a_full_session() {
        let sm = StateMachine::new();
        for next in [
            PipelineState::Connecting,
            PipelineState::Connected,
            PipelineState::Handshaking,
            PipelineState::Ready,
            PipelineState::Starting,
            PipelineState::Streaming,
            PipelineState::Stopping,
            PipelineState::Ready,
        ] {
            sm.transition(next).unwrap();
        }
        assert_eq!(sm.current(), PipelineState::Ready);
    }

    #[test]
    fn illegal_transition_is_refused_and_state_unchanged() {
        let sm = StateMachine::new();
        let err = sm.transition(PipelineState::Streaming).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(sm.current(), PipelineState::Disconnected);
    }

    #[test]
    fn error_state_can_recover_to_disconnected_or_connecting() {
        let sm = StateMachine::new();
        sm.transition(PipelineState::Connecting).unwrap();
        sm.transition(PipelineState::Error).unwrap();
        sm.transition(PipelineState::Connecting).unwrap();
        assert_eq!(sm.current(), PipelineState::Connecting);
    }

    #[test]
    fn observers_are_notified_on_every_transition() {
        let sm = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        sm.observe(Box::new(move |_from, _to| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        sm.transition(PipelineState::Connecting).unwrap();
        sm.transition(PipelineState::Connected).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn observers_not_notified_on_refused_transition() {
        let sm = StateMachine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        sm.observe(Box::new(move |_from, _to| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        let _ = sm.transition(PipelineState::Streaming);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
