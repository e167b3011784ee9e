//! Lifecycle controller: owns the running instance and the lifecycle state
//! machine.
//!
//! The controller does no I/O. The orchestrator calls `begin_*` before it
//! spawns the engine work and reports the outcome back with the generation it
//! was given. Every instance gets a fresh generation, so outcomes and guest
//! notifications that belong to an earlier instance are recognised and
//! dropped.
//!
//! ```text
//! begin_start() ─► Starting ─► start_succeeded() ─► Running
//!                           ├► start_aborted()   ─► previous state
//!                           └► start_failed()    ─► Failed
//! begin_stop()  ─► Stopping ─► stop_finished()   ─► Stopped | Running
//! instance_event()          ─► Stopped | Failed  (from any live state)
//! ```

use std::sync::Arc;

use statig::blocking::StateMachine;
use statig::prelude::*;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, InstanceEvent, VmInstance};
use crate::state_machine::lifecycle_sm::{LifecycleEvent, LifecycleMachine, State};
use crate::vm::LifecycleState;
use crate::vm::error::{VmError, VmResult};

pub struct LifecycleController {
    machine: StateMachine<LifecycleMachine>,
    instance: Option<Arc<dyn VmInstance>>,
    generation: u64,
    engine_started: bool,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            machine: LifecycleMachine.state_machine(),
            instance: None,
            generation: 0,
            engine_started: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self.machine.state() {
            State::Stopped {} => LifecycleState::Stopped,
            State::Starting { .. } => LifecycleState::Starting,
            State::Running {} => LifecycleState::Running,
            State::Stopping {} => LifecycleState::Stopping,
            State::Failed { reason } => LifecycleState::Failed(reason.clone()),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Whether the engine was ever asked to boot. Until then the published
    /// state is derived from the bundle instead.
    pub fn has_run(&self) -> bool {
        self.engine_started
    }

    /// Enter `Starting` and return the generation of the instance to come.
    pub fn begin_start(&mut self) -> VmResult<u64> {
        let state = self.state();
        if !matches!(state, LifecycleState::Stopped | LifecycleState::Failed(_)) {
            return Err(VmError::invalid_transition("start", state));
        }
        self.generation += 1;
        self.machine.handle(&LifecycleEvent::Start);
        debug!(generation = self.generation, "start requested");
        Ok(self.generation)
    }

    /// Preparation failed before the engine ran; restore the prior state.
    pub fn start_aborted(&mut self, generation: u64) {
        if self.is_current(generation, LifecycleState::Starting) {
            self.machine.handle(&LifecycleEvent::StartAborted);
        }
    }

    /// Adopt a started instance. Returns `false` when the outcome is stale and
    /// the caller must dispose of the instance itself.
    pub fn start_succeeded(&mut self, generation: u64, instance: Arc<dyn VmInstance>) -> bool {
        if !self.is_current(generation, LifecycleState::Starting) {
            warn!(generation, "discarding instance from a superseded start");
            return false;
        }
        self.instance = Some(instance);
        self.engine_started = true;
        self.machine.handle(&LifecycleEvent::Started);
        info!(generation, "VM running");
        true
    }

    pub fn start_failed(&mut self, generation: u64, reason: String) {
        if self.is_current(generation, LifecycleState::Starting) {
            self.instance = None;
            self.engine_started = true;
            self.machine.handle(&LifecycleEvent::StartFailed(reason));
        }
    }

    /// Enter `Stopping` and hand out the instance to stop.
    pub fn begin_stop(&mut self) -> VmResult<(u64, Arc<dyn VmInstance>)> {
        let state = self.state();
        let instance = match (&state, &self.instance) {
            (LifecycleState::Running, Some(instance)) => Arc::clone(instance),
            _ => return Err(VmError::invalid_transition("stop", state)),
        };
        self.machine.handle(&LifecycleEvent::Stop);
        Ok((self.generation, instance))
    }

    /// Apply the outcome of an explicit stop.
    ///
    /// A stop that lands after the guest already went away (reconciled by
    /// [`Self::instance_event`]) reports success.
    pub fn stop_finished(
        &mut self,
        generation: u64,
        result: Result<(), EngineError>,
    ) -> VmResult<()> {
        if !self.is_current(generation, LifecycleState::Stopping) {
            debug!(generation, "stop finished after the instance was already gone");
            return Ok(());
        }
        match result {
            Ok(()) => {
                self.instance = None;
                self.machine.handle(&LifecycleEvent::StopCompleted);
                info!(generation, "VM stopped");
                Ok(())
            }
            Err(e) => {
                self.machine.handle(&LifecycleEvent::StopFailed);
                warn!(generation, error = %e, "stop failed, VM still running");
                Err(VmError::Instance(e.to_string()))
            }
        }
    }

    /// Reconcile an unsolicited notification. Returns whether it changed
    /// anything.
    pub fn instance_event(&mut self, generation: u64, event: InstanceEvent) -> bool {
        if generation != self.generation || !self.is_live() {
            debug!(generation, %event, "ignoring stale instance event");
            return false;
        }
        self.instance = None;
        match event {
            InstanceEvent::GuestStopped => self.machine.handle(&LifecycleEvent::GuestStopped),
            InstanceEvent::StoppedWithError(reason) => {
                self.machine.handle(&LifecycleEvent::Crashed(reason))
            }
        }
        true
    }

    fn is_current(&self, generation: u64, expected: LifecycleState) -> bool {
        generation == self.generation && self.state() == expected
    }
}
