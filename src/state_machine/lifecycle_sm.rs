//! VM lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Stopped ──Start──► Live (superstate)
//! Failed  ──Start──►   ├── Starting { previous }
//!                      ├── Running
//!                      └── Stopping
//!
//! Live ──GuestStopped──► Stopped
//! Live ──Crashed──────► Failed { reason }
//! ```
//!
//! The machine only decides transitions. Validity of caller commands is
//! checked by the lifecycle controller before an event is dispatched, so
//! events that do not apply in a state are simply absorbed.

use statig::prelude::*;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// A caller asked to start the VM.
    Start,
    /// Requirement resolution or configuration failed before the engine ran.
    StartAborted,
    /// The engine reported a running instance.
    Started,
    /// The engine could not start the instance.
    StartFailed(String),
    /// A caller asked to stop the VM.
    Stop,
    /// The explicit stop took effect.
    StopCompleted,
    /// The explicit stop was refused; the instance keeps running.
    StopFailed,
    /// The guest shut itself down.
    GuestStopped,
    /// The instance died with an error.
    Crashed(String),
}

// ---------------------------------------------------------------------------
// Shared storage
// ---------------------------------------------------------------------------

/// Storage for the lifecycle machine. Resources live in the controller; the
/// machine itself holds nothing but its state.
#[derive(Debug, Default)]
pub struct LifecycleMachine;

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[state_machine(
    initial = "State::stopped()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    /// Any state in which an instance may exist.
    #[superstate]
    fn live(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::GuestStopped => {
                info!("guest stopped on its own");
                Transition(State::stopped())
            }
            LifecycleEvent::Crashed(reason) => {
                warn!(%reason, "instance stopped with error");
                Transition(State::failed(reason.clone()))
            }
            other => {
                debug!(event = ?other, "event ignored while live");
                Handled
            }
        }
    }

    #[state]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => Transition(State::starting(None)),
            _ => Handled,
        }
    }

    /// `previous` is the failure reason to restore if preparation aborts.
    #[state(superstate = "live")]
    fn starting(&mut self, event: &LifecycleEvent, previous: &Option<String>) -> Outcome<State> {
        match event {
            LifecycleEvent::Started => Transition(State::running()),
            LifecycleEvent::StartFailed(reason) => Transition(State::failed(reason.clone())),
            LifecycleEvent::StartAborted => match previous {
                Some(reason) => Transition(State::failed(reason.clone())),
                None => Transition(State::stopped()),
            },
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Stop => Transition(State::stopping()),
            _ => Super,
        }
    }

    #[state(superstate = "live")]
    fn stopping(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StopCompleted => Transition(State::stopped()),
            LifecycleEvent::StopFailed => Transition(State::running()),
            _ => Super,
        }
    }

    /// A new start is allowed exactly as from `Stopped`.
    #[state]
    fn failed(&mut self, event: &LifecycleEvent, reason: &String) -> Outcome<State> {
        match event {
            LifecycleEvent::Start => Transition(State::starting(Some(reason.clone()))),
            _ => Handled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> statig::blocking::StateMachine<LifecycleMachine> {
        LifecycleMachine.state_machine()
    }

    #[test]
    fn start_then_stop() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Start);
        assert_eq!(sm.state(), &State::starting(None));
        sm.handle(&LifecycleEvent::Started);
        sm.handle(&LifecycleEvent::Stop);
        assert_eq!(sm.state(), &State::stopping());
        sm.handle(&LifecycleEvent::StopCompleted);
        assert_eq!(sm.state(), &State::stopped());
    }

    #[test]
    fn aborted_start_restores_failure() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::StartFailed("boom".into()));
        assert_eq!(sm.state(), &State::failed("boom".into()));

        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::StartAborted);
        assert_eq!(sm.state(), &State::failed("boom".into()));
    }

    #[test]
    fn stop_failure_returns_to_running() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::Started);
        sm.handle(&LifecycleEvent::Stop);
        sm.handle(&LifecycleEvent::StopFailed);
        assert_eq!(sm.state(), &State::running());
    }

    #[test]
    fn guest_events_reconcile_from_any_live_state() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::Started);
        sm.handle(&LifecycleEvent::Stop);
        sm.handle(&LifecycleEvent::GuestStopped);
        assert_eq!(sm.state(), &State::stopped());

        sm.handle(&LifecycleEvent::Start);
        sm.handle(&LifecycleEvent::Crashed("kernel panic".into()));
        assert_eq!(sm.state(), &State::failed("kernel panic".into()));
    }

    #[test]
    fn guest_events_are_ignored_when_not_live() {
        let mut sm = machine();
        sm.handle(&LifecycleEvent::GuestStopped);
        sm.handle(&LifecycleEvent::Crashed("late".into()));
        sm.handle(&LifecycleEvent::StopCompleted);
        assert_eq!(sm.state(), &State::stopped());
    }
}
